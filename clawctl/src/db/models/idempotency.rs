//! Checkout idempotency entries.

use serde_json::Value;
use sqlx::FromRow;

/// Marker tag stored in the `response` column while a request is in flight.
pub const IN_PROGRESS_STATE: &str = "in_progress";

#[derive(Debug, Clone, FromRow)]
pub struct IdempotencyRow {
    pub key: String,
    pub fingerprint: String,
    pub response: String,
    pub created_at: i64,
}

/// Outcome of `begin_checkout_idempotency`.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyBeginOutcome {
    /// The slot is ours; proceed with the side effect.
    Acquired,
    /// Same key, different request fingerprint.
    Conflict,
    /// A previous identical request completed; return its stored response.
    Completed(Value),
    /// An identical request is still in flight; retry after the given seconds.
    InProgress { retry_after_seconds: u64 },
}

/// Build the in-progress marker stored while a request runs.
pub fn in_progress_marker(now_ms: i64) -> Value {
    serde_json::json!({ "state": IN_PROGRESS_STATE, "updatedAt": now_ms })
}

/// Parse a stored response: `Some(updated_at)` when it is an in-progress
/// marker, `None` when it is a completed response body.
pub fn parse_in_progress(response: &str) -> Option<i64> {
    let value: Value = serde_json::from_str(response).ok()?;
    if value.get("state")?.as_str()? == IN_PROGRESS_STATE {
        value.get("updatedAt")?.as_i64()
    } else {
        None
    }
}
