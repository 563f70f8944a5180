//! Webhook intake: verify, dedupe, dispatch, finalize.
//!
//! The signature check runs on the raw byte sequence before any JSON parse.
//! Dedup guarantees each event id reaches the dispatch logic at most once
//! per successful outcome; failed entries permit retries, which the order
//! state machine's idempotent transitions make safe.

use crate::AppState;
use crate::billing::bridge;
use crate::db::handlers::{Orders, WebhookEvents};
use crate::db::models::orders::{Order, PaymentSettlement};
use crate::db::models::webhook_events::{WebhookBeginOutcome, WebhookEventStatus};
use crate::errors::{Error, Result};
use crate::payments::{CheckoutSessionObject, WebhookEvent};
use axum::http::{HeaderMap, StatusCode};
use serde_json::{Value, json};
use tracing::instrument;
use uuid::Uuid;

/// Fixed message recorded when the provider reports an async payment failure.
const ASYNC_PAYMENT_FAILED_MESSAGE: &str = "asynchronous payment failed";

struct DispatchResult {
    status: WebhookEventStatus,
    error: Option<String>,
    response: Value,
}

/// Handle a webhook delivery end to end. Returns `(status, body)`.
#[instrument(skip_all)]
pub async fn handle_webhook(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(StatusCode, Value)> {
    let gateway = state.gateway.as_ref().ok_or_else(|| Error::NotConfigured {
        feature: "payment provider".to_string(),
    })?;

    // Signature first, on the raw body. Verification failures never touch
    // the store.
    let event = gateway.verify_webhook(headers, body).map_err(|e| Error::BadRequest {
        message: e.to_string(),
        details: None,
    })?;

    tracing::info!(event_id = %event.id, event_type = %event.event_type, "Received webhook event");

    let timeout_ms = state.config.billing.webhook_processing_timeout_ms;
    {
        let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
        let mut dedup = WebhookEvents::new(&mut conn);
        match dedup.begin(&event.id, &event.event_type, timeout_ms).await? {
            WebhookBeginOutcome::ShouldProcess => {}
            WebhookBeginOutcome::AlreadyDone(status) => {
                return Ok((
                    StatusCode::OK,
                    json!({ "ok": true, "received": true, "duplicate": true, "status": status.to_db_string() }),
                ));
            }
            WebhookBeginOutcome::InProgress => {
                return Ok((StatusCode::OK, json!({ "ok": true, "received": true, "inProgress": true })));
            }
        }
    }

    let result = dispatch(state, &event).await;

    // The dedup entry always completes, even when dispatch failed; a failed
    // entry permits later retries.
    let (status, error, response) = match result {
        Ok(outcome) => (outcome.status, outcome.error, outcome.response),
        Err(e) => {
            let message = e.user_message();
            (WebhookEventStatus::Failed, Some(message.clone()), json!({ "ok": false, "error": message }))
        }
    };

    {
        let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
        let mut dedup = WebhookEvents::new(&mut conn);
        dedup.complete(&event.id, status, error.as_deref()).await?;
    }

    let http_status = if status == WebhookEventStatus::Failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    Ok((http_status, response))
}

async fn dispatch(state: &AppState, event: &WebhookEvent) -> Result<DispatchResult> {
    match event.event_type.as_str() {
        "checkout.session.completed" => {
            let session = require_session(event)?;
            if session.is_paid() {
                settle_paid(state, session, &event.raw_object).await
            } else {
                record_pending_async(state, session, &event.raw_object).await
            }
        }
        "checkout.session.async_payment_succeeded" => {
            let session = require_session(event)?;
            settle_paid(state, session, &event.raw_object).await
        }
        "checkout.session.async_payment_failed" => {
            let session = require_session(event)?;
            let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
            let mut orders = Orders::new(&mut conn);
            match orders.get_by_checkout_session(&session.id).await? {
                Some(order) => {
                    let order = orders.mark_failed(order.id, ASYNC_PAYMENT_FAILED_MESSAGE).await?;
                    orders
                        .append_event(order.id, "payment.async_failed", ASYNC_PAYMENT_FAILED_MESSAGE, None)
                        .await?;
                    Ok(DispatchResult {
                        status: WebhookEventStatus::Processed,
                        error: None,
                        response: json!({ "ok": true, "received": true, "orderId": order.id, "orderStatus": order.status.to_db_string() }),
                    })
                }
                None => Ok(fail_no_order(&session.id)),
            }
        }
        "checkout.session.expired" => {
            let session = require_session(event)?;
            let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
            let mut orders = Orders::new(&mut conn);
            match orders.mark_expired_by_checkout_session(&session.id).await? {
                Some(order) => {
                    orders
                        .append_event(order.id, "checkout.expired", "checkout session expired", None)
                        .await?;
                    Ok(DispatchResult {
                        status: WebhookEventStatus::Processed,
                        error: None,
                        response: json!({ "ok": true, "received": true, "orderId": order.id, "orderStatus": order.status.to_db_string() }),
                    })
                }
                None => Ok(fail_no_order(&session.id)),
            }
        }
        other => {
            tracing::debug!(event_type = other, "Ignoring unhandled webhook event type");
            Ok(DispatchResult {
                status: WebhookEventStatus::Ignored,
                error: None,
                response: json!({ "ok": true, "received": true, "ignored": true }),
            })
        }
    }
}

fn require_session(event: &WebhookEvent) -> Result<&CheckoutSessionObject> {
    event.session.as_ref().ok_or_else(|| Error::BadRequest {
        message: format!("event {} carries no checkout session object", event.event_type),
        details: None,
    })
}

fn fail_no_order(session_id: &str) -> DispatchResult {
    DispatchResult {
        status: WebhookEventStatus::Failed,
        error: Some(format!("no order for checkout session {session_id}")),
        response: json!({ "ok": false, "error": "no order for checkout session" }),
    }
}

/// Locate the order for a session: by the persisted session id, falling back
/// to the order id the checkout flow stamped into session metadata (covers a
/// webhook racing the session attach write).
async fn find_order(orders: &mut Orders<'_>, session: &CheckoutSessionObject, raw_object: &Value) -> Result<Option<Order>> {
    if let Some(order) = orders.get_by_checkout_session(&session.id).await? {
        return Ok(Some(order));
    }

    let Some(order_id) = raw_object
        .pointer("/metadata/order_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
    else {
        return Ok(None);
    };

    match orders.get_by_id(order_id).await? {
        Some(order) => {
            let order = orders.attach_checkout_session(order.id, &session.id, order.checkout_url.as_deref().unwrap_or("")).await?;
            Ok(Some(order))
        }
        None => Ok(None),
    }
}

async fn settle_paid(state: &AppState, session: &CheckoutSessionObject, raw_object: &Value) -> Result<DispatchResult> {
    let order = {
        let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
        let mut orders = Orders::new(&mut conn);

        let Some(order) = find_order(&mut orders, session, raw_object).await? else {
            return Ok(fail_no_order(&session.id));
        };

        let settlement = PaymentSettlement {
            payment_intent_id: session.payment_intent.clone(),
            customer_id: session.customer.clone(),
            customer_email: session.buyer_email(),
        };
        let order = orders.mark_paid(order.id, &settlement).await?;
        orders
            .append_event(order.id, "payment.settled", "payment settlement reported", None)
            .await?;
        order
    };

    // Auto-provision: the default tenant owns webhook-driven deployments
    // until per-order owner capture lands.
    let mut response = json!({
        "ok": true,
        "received": true,
        "orderId": order.id,
        "orderStatus": order.status.to_db_string(),
        "pendingAsyncPayment": false,
    });

    if state.config.billing.auto_provision_on_paid && order.status == crate::db::models::orders::OrderStatus::Paid {
        let owner = state.auth.default_user_id().clone();
        match bridge::provision_order(state, order.id, &owner).await {
            Ok(result) => {
                response["deploymentId"] = json!(result.deployment.id);
                response["created"] = json!(result.created);
            }
            Err(e) => {
                let message = format!("settlement recorded but deployment queueing failed: {}", e.user_message());
                tracing::error!(order_id = %order.id, "{message}");
                return Ok(DispatchResult {
                    status: WebhookEventStatus::Failed,
                    error: Some(message.clone()),
                    response: json!({ "ok": false, "error": message }),
                });
            }
        }
    }

    Ok(DispatchResult {
        status: WebhookEventStatus::Processed,
        error: None,
        response,
    })
}

/// Checkout completed without settled payment: persist the linkage, record
/// the pending state, do not transition.
async fn record_pending_async(state: &AppState, session: &CheckoutSessionObject, raw_object: &Value) -> Result<DispatchResult> {
    let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
    let mut orders = Orders::new(&mut conn);

    let Some(order) = find_order(&mut orders, session, raw_object).await? else {
        return Ok(fail_no_order(&session.id));
    };

    orders
        .append_event(
            order.id,
            "payment.pending_async",
            "checkout completed, awaiting asynchronous settlement",
            Some(&json!({ "checkoutSessionId": session.id })),
        )
        .await?;

    Ok(DispatchResult {
        status: WebhookEventStatus::Processed,
        error: None,
        response: json!({
            "ok": true,
            "received": true,
            "orderId": order.id,
            "orderStatus": order.status.to_db_string(),
            "pendingAsyncPayment": true,
        }),
    })
}
