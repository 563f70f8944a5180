//! Dedup repository for incoming payment provider webhooks.
//!
//! Each event id is dispatched to business logic at most once per successful
//! outcome. A `processing` entry older than the configured timeout is assumed
//! abandoned (worker crash) and is recovered; a `failed` entry is retried on
//! the next delivery.

use crate::db::errors::Result;
use crate::db::models::webhook_events::{WebhookBeginOutcome, WebhookEventRow, WebhookEventStatus};
use crate::types::now_ms;
use sqlx::SqliteConnection;
use tracing::instrument;

pub struct WebhookEvents<'c> {
    db: &'c mut SqliteConnection,
}

impl<'c> WebhookEvents<'c> {
    pub fn new(db: &'c mut SqliteConnection) -> Self {
        Self { db }
    }

    pub async fn get(&mut self, event_id: &str) -> Result<Option<WebhookEventRow>> {
        let row = sqlx::query_as::<_, WebhookEventRow>("SELECT * FROM stripe_webhook_events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(row)
    }

    /// Begin-or-dedupe an event id. The insert races are settled by the
    /// primary key: whoever inserts first processes the event.
    #[instrument(skip(self), fields(event_id = %event_id, event_type = %event_type), err)]
    pub async fn begin(&mut self, event_id: &str, event_type: &str, processing_timeout_ms: i64) -> Result<WebhookBeginOutcome> {
        let now = now_ms();

        let inserted = sqlx::query(
            r#"
            INSERT INTO stripe_webhook_events (event_id, event_type, status, received_at, updated_at)
            VALUES (?, ?, 'processing', ?, ?)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(now)
        .bind(now)
        .execute(&mut *self.db)
        .await?;

        if inserted.rows_affected() > 0 {
            return Ok(WebhookBeginOutcome::ShouldProcess);
        }

        let existing = self
            .get(event_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("webhook dedup row for {event_id} vanished after insert conflict"))?;
        match WebhookEventStatus::from_db_string(&existing.status) {
            status @ (WebhookEventStatus::Processed | WebhookEventStatus::Ignored) => Ok(WebhookBeginOutcome::AlreadyDone(status)),
            WebhookEventStatus::Failed => {
                // Retry a failed delivery: flip back to processing.
                sqlx::query(
                    "UPDATE stripe_webhook_events SET status = 'processing', error = NULL, updated_at = ? WHERE event_id = ? AND status = 'failed'",
                )
                .bind(now)
                .bind(event_id)
                .execute(&mut *self.db)
                .await?;
                Ok(WebhookBeginOutcome::ShouldProcess)
            }
            WebhookEventStatus::Processing => {
                if now - existing.updated_at < processing_timeout_ms {
                    return Ok(WebhookBeginOutcome::InProgress);
                }
                // Stale processing entry: the previous worker is assumed gone.
                let recovered = sqlx::query(
                    r#"
                    UPDATE stripe_webhook_events
                    SET status = 'processing', error = 'recovered stale lease', updated_at = ?
                    WHERE event_id = ? AND status = 'processing' AND updated_at < ?
                    "#,
                )
                .bind(now)
                .bind(event_id)
                .bind(now - processing_timeout_ms)
                .execute(&mut *self.db)
                .await?;

                if recovered.rows_affected() > 0 {
                    Ok(WebhookBeginOutcome::ShouldProcess)
                } else {
                    // Someone else recovered it between our read and write.
                    Ok(WebhookBeginOutcome::InProgress)
                }
            }
        }
    }

    /// Finalize a dedup entry. `processed_at` is set only for final
    /// successful outcomes.
    #[instrument(skip(self, error), fields(event_id = %event_id, status = ?status), err)]
    pub async fn complete(&mut self, event_id: &str, status: WebhookEventStatus, error: Option<&str>) -> Result<()> {
        let now = now_ms();
        let processed_at = match status {
            WebhookEventStatus::Processed | WebhookEventStatus::Ignored => Some(now),
            _ => None,
        };

        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET status = ?, error = ?, updated_at = ?, processed_at = ?
            WHERE event_id = ?
            "#,
        )
        .bind(status.to_db_string())
        .bind(error)
        .bind(now)
        .bind(processed_at)
        .bind(event_id)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }
}
