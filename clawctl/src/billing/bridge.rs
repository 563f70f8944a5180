//! The bridge: converting a paid order into a queued deployment.
//!
//! At most one deployment exists per paid order. The unique constraint on
//! `billing_ref` arbitrates concurrent bridge attempts: the loser of the
//! insert race re-reads the winner's row and links the order to it, so both
//! callers observe the same deployment id.

use crate::AppState;
use crate::api::models::deployments::{DeploymentInput, validation_details};
use crate::db::handlers::{Deployments, Orders};
use crate::db::models::deployments::{Deployment, DeploymentCreateDBRequest};
use crate::db::models::orders::{OrderStatus, PaymentSettlement};
use crate::errors::{Error, Result};
use crate::types::{OrderId, UserId, abbrev_uuid};
use tracing::instrument;

/// Outcome of a bridge attempt.
#[derive(Debug, Clone)]
pub struct BridgeResult {
    /// Whether this call created the deployment (false: it already existed
    /// and the order was merely linked).
    pub created: bool,
    pub deployment: Deployment,
}

/// Queue a deployment for a paid order, owned by `owner`.
#[instrument(skip(state), fields(order_id = %abbrev_uuid(&order_id), owner = %owner), err)]
pub async fn provision_order(state: &AppState, order_id: OrderId, owner: &UserId) -> Result<BridgeResult> {
    let mut orders_conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
    let mut orders = Orders::new(&mut orders_conn);

    let order = orders.get_by_id(order_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Order".to_string(),
        id: order_id.to_string(),
    })?;

    // An existing deployment for this order wins immediately; just make sure
    // the order is linked.
    let mut deployments_conn = state.deployments_db.acquire().await.map_err(anyhow::Error::from)?;
    {
        let mut deployments = Deployments::new(&mut deployments_conn);
        if let Some(existing) = deployments.get_by_billing_ref(order_id).await? {
            orders.mark_deployment_created(order_id, existing.id).await?;
            return Ok(BridgeResult {
                created: false,
                deployment: existing,
            });
        }
    }

    match order.status {
        OrderStatus::Paid => {}
        OrderStatus::PendingPayment => {
            return Err(Error::conflict("order has not been paid"));
        }
        OrderStatus::Expired | OrderStatus::Canceled | OrderStatus::DeploymentCreated => {
            return Err(Error::conflict(format!(
                "order is {} and cannot be provisioned",
                order.status.to_db_string()
            )));
        }
        // A settled order that failed in a previous bridge attempt is
        // retriable: restore it to paid (a legal failed -> paid transition)
        // and continue.
        OrderStatus::Failed => {}
    }
    if order.paid_at.is_none() {
        return Err(Error::conflict("order has no settlement timestamp"));
    }
    if order.status == OrderStatus::Failed {
        let order = orders.mark_paid(order_id, &PaymentSettlement::default()).await?;
        if order.status != OrderStatus::Paid {
            return Err(Error::conflict(format!(
                "order is {} and cannot be provisioned",
                order.status.to_db_string()
            )));
        }
    }

    // Decrypt and re-validate the stored intent. A ciphertext that no longer
    // decrypts is terminal for the order.
    let intent: DeploymentInput = match state.cipher.decrypt(&order.deployment_intent_enc) {
        Ok(intent) => intent,
        Err(_) => {
            orders.mark_failed(order_id, "stored payload cannot be decrypted").await?;
            orders
                .append_event(order_id, "bridge.failed", "stored deployment intent cannot be decrypted", None)
                .await?;
            return Err(Error::UndecryptablePayload {
                resource: "Order".to_string(),
                id: order_id.to_string(),
            });
        }
    };

    let validated = intent.validate().map_err(|errors| Error::BadRequest {
        message: "stored deployment intent failed validation".to_string(),
        details: Some(validation_details(&errors)),
    })?;

    let config_enc = state.cipher.encrypt(&validated.config).map_err(anyhow::Error::from)?;
    let secrets_enc = state.cipher.encrypt(&validated.secrets).map_err(anyhow::Error::from)?;

    let request = DeploymentCreateDBRequest {
        name: validated.config.name.clone(),
        owner_user_id: owner.clone(),
        config_enc,
        secrets_enc,
        metadata: serde_json::json!({ "planId": order.plan_id }),
        billing_ref: Some(order_id),
    };

    let mut deployments = Deployments::new(&mut deployments_conn);
    let (created, deployment) = match deployments.create(&request).await {
        Ok(deployment) => (true, deployment),
        Err(e) if e.is_unique_violation() => {
            // Lost the race: link to the winner.
            let existing = deployments
                .get_by_billing_ref(order_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("billing_ref conflict but no deployment row for order {order_id}"))?;
            (false, existing)
        }
        Err(e) => {
            let order = orders.mark_failed(order_id, &format!("failed to queue deployment: {e}")).await?;
            orders
                .append_event(order_id, "bridge.failed", "failed to queue deployment", None)
                .await?;
            tracing::error!(order_status = order.status.to_db_string(), "Bridge failed to queue deployment: {e}");
            return Err(Error::Database(e));
        }
    };

    if created {
        deployments
            .append_event(deployment.id, "queued", "deployment queued from paid order", None)
            .await?;
        state.hooks.deployment_changed(deployment.id);
        state.hooks.event_appended(deployment.id, "queued");
    }

    let order = orders.mark_deployment_created(order_id, deployment.id).await?;
    if created {
        orders
            .append_event(
                order_id,
                "deployment.created",
                "deployment queued",
                Some(&serde_json::json!({ "deploymentId": deployment.id })),
            )
            .await?;
    }

    tracing::info!(
        deployment_id = %abbrev_uuid(&deployment.id),
        order_status = order.status.to_db_string(),
        created,
        "Bridged order to deployment"
    );

    Ok(BridgeResult { created, deployment })
}
