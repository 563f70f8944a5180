//! Checkout orchestration: idempotency, order creation, hosted session.

use crate::AppState;
use crate::api::models::deployments::validation_details;
use crate::api::models::orders::{CheckoutRequest, OrderResponse};
use crate::auth::CurrentUser;
use crate::db::handlers::{CheckoutIdempotency, Orders};
use crate::db::models::idempotency::IdempotencyBeginOutcome;
use crate::db::models::orders::OrderCreateDBRequest;
use crate::errors::{Error, Result};
use crate::fingerprint::fingerprint;
use crate::payments::CheckoutSessionRequest;
use axum::http::StatusCode;
use serde_json::{Value, json};
use tracing::instrument;

/// Run the checkout flow and return `(status, body)`. The body is byte-for-
/// byte what an idempotent replay will see.
#[instrument(skip_all, fields(plan_id = %request.plan_id, user = %user.id))]
pub async fn create_checkout(
    state: &AppState,
    user: &CurrentUser,
    idempotency_key: Option<String>,
    request: CheckoutRequest,
) -> Result<(StatusCode, Value)> {
    if state.config.plan(&request.plan_id).is_none() {
        return Err(Error::BadRequest {
            message: format!("unknown plan {:?}", request.plan_id),
            details: None,
        });
    }

    request.deployment.validate().map_err(|errors| Error::BadRequest {
        message: "deployment intent failed validation".to_string(),
        details: Some(validation_details(&errors)),
    })?;

    let success_url = request.success_url.clone().unwrap_or_else(|| state.config.billing.success_url.clone());
    let cancel_url = request.cancel_url.clone().unwrap_or_else(|| state.config.billing.cancel_url.clone());

    // Fingerprint input covers everything that makes two checkouts "the
    // same request": plan, full intent, email, redirect targets, metadata.
    let fingerprint_input = json!({
        "planId": request.plan_id,
        "deployment": request.deployment,
        "customerEmail": request.customer_email,
        "successUrl": success_url,
        "cancelUrl": cancel_url,
        "metadata": request.metadata,
    });
    let request_fingerprint = fingerprint(&fingerprint_input);

    if let Some(key) = &idempotency_key {
        let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
        let mut idempotency = CheckoutIdempotency::new(&mut conn);
        match idempotency.begin(key, &request_fingerprint, state.config.idempotency_stale_ms()).await? {
            IdempotencyBeginOutcome::Acquired => {}
            IdempotencyBeginOutcome::Conflict => {
                return Err(Error::conflict("Idempotency-Key was used with a different request"));
            }
            IdempotencyBeginOutcome::Completed(stored) => {
                return Ok((StatusCode::OK, stored));
            }
            IdempotencyBeginOutcome::InProgress { retry_after_seconds } => {
                return Err(Error::Conflict {
                    message: "an identical request is still in progress".to_string(),
                    retry_after_seconds: Some(retry_after_seconds),
                });
            }
        }
    }

    let result = run_checkout(state, user, &request, &success_url, &cancel_url).await;

    // Settle the idempotency slot either way: store the response for replay,
    // or release the key so the client can retry.
    if let Some(key) = &idempotency_key {
        let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
        let mut idempotency = CheckoutIdempotency::new(&mut conn);
        match &result {
            Ok((_, body)) => idempotency.finalize(key, &request_fingerprint, body).await?,
            Err(_) => idempotency.clear(key).await?,
        }
    }

    result
}

async fn run_checkout(
    state: &AppState,
    user: &CurrentUser,
    request: &CheckoutRequest,
    success_url: &str,
    cancel_url: &str,
) -> Result<(StatusCode, Value)> {
    let gateway = state.gateway.as_ref().ok_or_else(|| Error::NotConfigured {
        feature: "payment provider".to_string(),
    })?;
    let plan = state.config.plan(&request.plan_id).ok_or_else(|| Error::BadRequest {
        message: format!("unknown plan {:?}", request.plan_id),
        details: None,
    })?;

    let intent_enc = state.cipher.encrypt(&request.deployment).map_err(anyhow::Error::from)?;

    // The initiating tenant rides in order metadata so webhook-driven
    // provisioning could recover it later.
    let mut metadata = serde_json::Map::new();
    metadata.insert("initiatedBy".to_string(), Value::String(user.id.clone()));
    for (key, value) in &request.metadata {
        metadata.insert(key.clone(), Value::String(value.clone()));
    }

    let order = {
        let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
        let mut orders = Orders::new(&mut conn);
        let order = orders
            .create(&OrderCreateDBRequest {
                plan_id: plan.id.clone(),
                amount: plan.amount,
                currency: plan.currency.clone(),
                deployment_intent_enc: intent_enc,
                metadata: Value::Object(metadata),
                customer_email: request.customer_email.clone(),
            })
            .await?;
        orders
            .append_event(order.id, "checkout.created", "order created, requesting checkout session", None)
            .await?;
        order
    };

    let session_request = CheckoutSessionRequest {
        order_id: order.id.to_string(),
        client_reference_id: user.id.clone(),
        plan_name: plan.name.clone(),
        plan_description: plan.description.clone(),
        amount: plan.amount,
        currency: plan.currency.clone(),
        customer_email: request.customer_email.clone(),
        success_url: success_url.to_string(),
        cancel_url: cancel_url.to_string(),
        metadata: request.metadata.clone().into_iter().collect(),
    };

    let session = match gateway.create_checkout_session(&session_request).await {
        Ok(session) => session,
        Err(e) => {
            let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
            let mut orders = Orders::new(&mut conn);
            orders.mark_failed(order.id, &format!("checkout session creation failed: {e}")).await?;
            orders
                .append_event(order.id, "checkout.failed", "payment provider rejected checkout session", None)
                .await?;
            return Err(Error::Downstream {
                message: format!("checkout session creation failed: {e}"),
            });
        }
    };

    let order = {
        let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
        let mut orders = Orders::new(&mut conn);
        let order = orders.attach_checkout_session(order.id, &session.id, &session.url).await?;
        orders
            .append_event(
                order.id,
                "checkout.session_issued",
                "hosted checkout session issued",
                Some(&json!({ "checkoutSessionId": session.id })),
            )
            .await?;
        order
    };

    let body = json!({
        "ok": true,
        "order": OrderResponse::from(order),
        "checkoutUrl": session.url,
    });

    Ok((StatusCode::CREATED, body))
}
