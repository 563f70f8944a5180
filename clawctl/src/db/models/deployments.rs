//! Database models for deployments.

use crate::types::{DeploymentId, OrderId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Provisioning,
    Running,
    Failed,
    Canceled,
}

impl DeploymentStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Provisioning => "provisioning",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Canceled => "canceled",
        }
    }

    pub fn from_db_string(s: &str) -> DeploymentStatus {
        match s {
            "pending" => DeploymentStatus::Pending,
            "provisioning" => DeploymentStatus::Provisioning,
            "running" => DeploymentStatus::Running,
            "canceled" => DeploymentStatus::Canceled,
            _ => DeploymentStatus::Failed,
        }
    }

    /// Terminal statuses carry no lease and no active task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Failed | DeploymentStatus::Canceled)
    }
}

/// The background job currently attached to a deployment, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveTask {
    Provision,
    Destroy,
}

impl ActiveTask {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            ActiveTask::Provision => "provision",
            ActiveTask::Destroy => "destroy",
        }
    }

    pub fn from_db_string(s: &str) -> Option<ActiveTask> {
        match s {
            "provision" => Some(ActiveTask::Provision),
            "destroy" => Some(ActiveTask::Destroy),
            _ => None,
        }
    }
}

// Database entity model
#[derive(Debug, Clone, FromRow)]
pub struct DeploymentRow {
    pub id: DeploymentId,
    pub provider: String,
    pub name: String,
    pub owner_user_id: String,
    pub status: String,
    pub active_task: Option<String>,
    pub config_enc: String,
    pub secrets_enc: String,
    pub metadata: String,
    pub billing_ref: Option<OrderId>,
    pub server_id: Option<String>,
    pub server_name: Option<String>,
    pub public_ip: Option<String>,
    pub ssh_key_id: Option<String>,
    pub tailnet_url: Option<String>,
    pub gateway_token_enc: Option<String>,
    pub cancel_requested_at: Option<i64>,
    pub error_message: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Domain response for a deployment.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: DeploymentId,
    pub provider: String,
    pub name: String,
    pub owner_user_id: UserId,
    pub status: DeploymentStatus,
    pub active_task: Option<ActiveTask>,
    pub config_enc: String,
    pub secrets_enc: String,
    pub metadata: Value,
    pub billing_ref: Option<OrderId>,
    pub server_id: Option<String>,
    pub server_name: Option<String>,
    pub public_ip: Option<String>,
    pub ssh_key_id: Option<String>,
    pub tailnet_url: Option<String>,
    pub gateway_token_enc: Option<String>,
    pub cancel_requested_at: Option<i64>,
    pub error_message: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Deployment {
    /// Whether any provider-side resource handle is still attached.
    pub fn has_resources(&self) -> bool {
        self.server_id.is_some() || self.ssh_key_id.is_some()
    }
}

impl From<DeploymentRow> for Deployment {
    fn from(row: DeploymentRow) -> Self {
        Self {
            id: row.id,
            provider: row.provider,
            name: row.name,
            owner_user_id: row.owner_user_id,
            status: DeploymentStatus::from_db_string(&row.status),
            active_task: row.active_task.as_deref().and_then(ActiveTask::from_db_string),
            config_enc: row.config_enc,
            secrets_enc: row.secrets_enc,
            metadata: serde_json::from_str(&row.metadata).unwrap_or(Value::Null),
            billing_ref: row.billing_ref,
            server_id: row.server_id,
            server_name: row.server_name,
            public_ip: row.public_ip,
            ssh_key_id: row.ssh_key_id,
            tailnet_url: row.tailnet_url,
            gateway_token_enc: row.gateway_token_enc,
            cancel_requested_at: row.cancel_requested_at,
            error_message: row.error_message,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

/// Database request for creating a new deployment
#[derive(Debug, Clone)]
pub struct DeploymentCreateDBRequest {
    pub name: String,
    pub owner_user_id: UserId,
    pub config_enc: String,
    pub secrets_enc: String,
    pub metadata: Value,
    pub billing_ref: Option<OrderId>,
}

/// Partial update for provider resource handles. `Some(None)` clears the
/// handle, `Some(Some(v))` sets it, `None` leaves it untouched.
#[derive(Debug, Clone, Default)]
pub struct ResourceStateUpdate {
    pub server_id: Option<Option<String>>,
    pub server_name: Option<Option<String>>,
    pub public_ip: Option<Option<String>>,
    pub ssh_key_id: Option<Option<String>>,
    pub tailnet_url: Option<Option<String>>,
}

/// Append-only audit entry for a deployment.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeploymentEvent {
    pub id: i64,
    pub deployment_id: DeploymentId,
    pub event_type: String,
    pub message: String,
    pub payload: Option<String>,
    pub created_at: i64,
}
