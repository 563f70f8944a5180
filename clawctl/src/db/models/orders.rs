//! Database models for billing orders.

use crate::types::{DeploymentId, OrderId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Order lifecycle states. Only the transitions in the state machine are
/// legal; everything else is a no-op that returns the current row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    DeploymentCreated,
    Expired,
    Failed,
    Canceled,
}

impl OrderStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Paid => "paid",
            OrderStatus::DeploymentCreated => "deployment_created",
            OrderStatus::Expired => "expired",
            OrderStatus::Failed => "failed",
            OrderStatus::Canceled => "canceled",
        }
    }

    pub fn from_db_string(s: &str) -> OrderStatus {
        match s {
            "pending_payment" => OrderStatus::PendingPayment,
            "paid" => OrderStatus::Paid,
            "deployment_created" => OrderStatus::DeploymentCreated,
            "expired" => OrderStatus::Expired,
            "canceled" => OrderStatus::Canceled,
            _ => OrderStatus::Failed,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::DeploymentCreated | OrderStatus::Expired | OrderStatus::Canceled)
    }
}

// Database entity model
#[derive(Debug, Clone, FromRow)]
pub struct OrderRow {
    pub id: OrderId,
    pub provider: String,
    pub status: String,
    pub plan_id: String,
    pub amount: i64,
    pub currency: String,
    pub deployment_intent_enc: String,
    pub metadata: String,
    pub checkout_session_id: Option<String>,
    pub checkout_url: Option<String>,
    pub payment_intent_id: Option<String>,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub deployment_id: Option<DeploymentId>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub paid_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Domain response for an order.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: OrderId,
    pub provider: String,
    pub status: OrderStatus,
    pub plan_id: String,
    pub amount: i64,
    pub currency: String,
    pub deployment_intent_enc: String,
    pub metadata: Value,
    pub checkout_session_id: Option<String>,
    pub checkout_url: Option<String>,
    pub payment_intent_id: Option<String>,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub deployment_id: Option<DeploymentId>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub paid_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        Self {
            id: row.id,
            provider: row.provider,
            status: OrderStatus::from_db_string(&row.status),
            plan_id: row.plan_id,
            amount: row.amount,
            currency: row.currency,
            deployment_intent_enc: row.deployment_intent_enc,
            metadata: serde_json::from_str(&row.metadata).unwrap_or(Value::Null),
            checkout_session_id: row.checkout_session_id,
            checkout_url: row.checkout_url,
            payment_intent_id: row.payment_intent_id,
            customer_id: row.customer_id,
            customer_email: row.customer_email,
            deployment_id: row.deployment_id,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            paid_at: row.paid_at,
            completed_at: row.completed_at,
        }
    }
}

/// Database request for creating a new order
#[derive(Debug, Clone)]
pub struct OrderCreateDBRequest {
    pub plan_id: String,
    pub amount: i64,
    pub currency: String,
    pub deployment_intent_enc: String,
    pub metadata: Value,
    pub customer_email: Option<String>,
}

/// Settlement details reported by a paid webhook; all fields fill with
/// COALESCE semantics, never overwriting a value already present.
#[derive(Debug, Clone, Default)]
pub struct PaymentSettlement {
    pub payment_intent_id: Option<String>,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
}

/// Append-only audit entry for an order.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OrderEvent {
    pub id: i64,
    pub order_id: OrderId,
    pub event_type: String,
    pub message: String,
    pub payload: Option<String>,
    pub created_at: i64,
}
