//! Dedup entries for incoming payment provider webhooks.

use serde::Serialize;
use sqlx::FromRow;

/// Final and intermediate dedup statuses for a webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventStatus {
    Processing,
    Processed,
    Ignored,
    Failed,
}

impl WebhookEventStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            WebhookEventStatus::Processing => "processing",
            WebhookEventStatus::Processed => "processed",
            WebhookEventStatus::Ignored => "ignored",
            WebhookEventStatus::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> WebhookEventStatus {
        match s {
            "processing" => WebhookEventStatus::Processing,
            "processed" => WebhookEventStatus::Processed,
            "ignored" => WebhookEventStatus::Ignored,
            _ => WebhookEventStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WebhookEventRow {
    pub event_id: String,
    pub event_type: String,
    pub status: String,
    pub error: Option<String>,
    pub received_at: i64,
    pub updated_at: i64,
    pub processed_at: Option<i64>,
}

/// Outcome of `begin_webhook_event`: whether this worker should run the
/// business logic, and why not otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookBeginOutcome {
    /// New event, or a recovered stale/failed entry - run the handler.
    ShouldProcess,
    /// A previous delivery already reached a final status.
    AlreadyDone(WebhookEventStatus),
    /// Another worker holds a live `processing` entry.
    InProgress,
}
