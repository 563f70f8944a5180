//! API models for orders and checkout.

use crate::api::models::deployments::DeploymentInput;
use crate::db::models::orders::{Order, OrderEvent};
use crate::types::{DeploymentId, OrderId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Body of `POST /v1/billing/checkout`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub plan_id: String,
    pub deployment: DeploymentInput,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
    /// Sorted map so the fingerprint sees a stable shape.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Public response shape for an order. The encrypted intent stays in the
/// store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: OrderId,
    pub provider: String,
    pub status: String,
    pub plan_id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<DeploymentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl From<Order> for OrderResponse {
    fn from(o: Order) -> Self {
        Self {
            id: o.id,
            provider: o.provider,
            status: o.status.to_db_string().to_string(),
            plan_id: o.plan_id,
            amount: o.amount,
            currency: o.currency,
            checkout_session_id: o.checkout_session_id,
            checkout_url: o.checkout_url,
            customer_email: o.customer_email,
            deployment_id: o.deployment_id,
            error_message: o.error_message,
            created_at: o.created_at,
            updated_at: o.updated_at,
            paid_at: o.paid_at,
            completed_at: o.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEventResponse {
    pub id: i64,
    pub event_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub created_at: i64,
}

impl From<OrderEvent> for OrderEventResponse {
    fn from(e: OrderEvent) -> Self {
        Self {
            id: e.id,
            event_type: e.event_type,
            message: e.message,
            payload: e.payload.and_then(|p| serde_json::from_str(&p).ok()),
            created_at: e.created_at,
        }
    }
}

/// Validate an `Idempotency-Key` header value: 1-200 chars from
/// `[A-Za-z0-9._:-]`.
pub fn valid_idempotency_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 200
        && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
}
