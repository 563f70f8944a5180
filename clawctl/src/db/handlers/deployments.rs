//! Database repository for deployments.
//!
//! Job leasing is a single predicated `UPDATE ... WHERE id = (SELECT ...)`
//! so that concurrent workers sharing the store can never both observe
//! "leased". Every resource-mutating operation carries the worker id and the
//! required source state in its WHERE clause; an operation that matches no
//! rows means the lease was lost and returns `None` rather than erroring.

use crate::db::errors::Result;
use crate::db::models::deployments::{
    ActiveTask, Deployment, DeploymentCreateDBRequest, DeploymentEvent, DeploymentRow, DeploymentStatus, ResourceStateUpdate,
};
use crate::types::{DeploymentId, OrderId, UserId, abbrev_uuid, now_ms};
use sqlx::SqliteConnection;
use tracing::instrument;
use uuid::Uuid;

/// Fixed message for a lease that expired before any provider resource was
/// attached.
pub const LEASE_EXPIRED_MESSAGE: &str = "lease expired before resources attached";

/// Error messages persisted on a deployment are bounded.
const MAX_ERROR_LEN: usize = 1000;

fn clamp_error(message: &str) -> String {
    let mut out = message.to_string();
    if out.len() > MAX_ERROR_LEN {
        out.truncate(MAX_ERROR_LEN);
    }
    out
}

/// What stale-lease recovery did to a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Resources were attached (or a cancel was pending): queued for destroy.
    DestroyQueued,
    /// Nothing was attached: failed outright.
    Failed,
}

pub struct Deployments<'c> {
    db: &'c mut SqliteConnection,
}

impl<'c> Deployments<'c> {
    pub fn new(db: &'c mut SqliteConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(name = %request.name, owner = %request.owner_user_id), err)]
    pub async fn create(&mut self, request: &DeploymentCreateDBRequest) -> Result<Deployment> {
        let now = now_ms();
        let id: DeploymentId = Uuid::new_v4();

        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            INSERT INTO deployments (
                id, provider, name, owner_user_id, status,
                config_enc, secrets_enc, metadata, billing_ref,
                created_at, updated_at
            )
            VALUES (?, 'hetzner', ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&request.name)
        .bind(&request.owner_user_id)
        .bind(DeploymentStatus::Pending.to_db_string())
        .bind(&request.config_enc)
        .bind(&request.secrets_enc)
        .bind(request.metadata.to_string())
        .bind(request.billing_ref)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(row.into())
    }

    #[instrument(skip(self), fields(deployment_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: DeploymentId) -> Result<Option<Deployment>> {
        let row = sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(row.map(Into::into))
    }

    /// Owner-scoped fetch; misses and foreign rows are both `None`.
    pub async fn get_owned(&mut self, owner: &UserId, id: DeploymentId) -> Result<Option<Deployment>> {
        let row = sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployments WHERE id = ? AND owner_user_id = ?")
            .bind(id)
            .bind(owner)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(row.map(Into::into))
    }

    pub async fn get_by_billing_ref(&mut self, order_id: OrderId) -> Result<Option<Deployment>> {
        let row = sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployments WHERE billing_ref = ?")
            .bind(order_id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(row.map(Into::into))
    }

    pub async fn list_owned(&mut self, owner: &UserId, skip: i64, limit: i64) -> Result<Vec<Deployment>> {
        let rows = sqlx::query_as::<_, DeploymentRow>(
            "SELECT * FROM deployments WHERE owner_user_id = ? ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
        )
        .bind(owner)
        .bind(limit)
        .bind(skip)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Atomically lease the oldest pending deployment for provisioning.
    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    pub async fn lease_provision(&mut self, worker_id: &str, lease_ms: i64) -> Result<Option<Deployment>> {
        let now = now_ms();
        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            UPDATE deployments
            SET status = 'provisioning',
                active_task = 'provision',
                lease_owner = ?,
                lease_expires_at = ?,
                started_at = COALESCE(started_at, ?),
                updated_at = ?
            WHERE id = (
                SELECT id FROM deployments
                WHERE status = 'pending'
                  AND (lease_owner IS NULL OR lease_expires_at < ?)
                ORDER BY created_at ASC
                LIMIT 1
            )
              AND status = 'pending'
              AND (lease_owner IS NULL OR lease_expires_at < ?)
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now + lease_ms)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Atomically lease the single eligible destroy job: a running deployment
    /// with a pending cancel, or a provisioning row whose active task is
    /// already `destroy`. Oldest cancel wins.
    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    pub async fn lease_destroy(&mut self, worker_id: &str, lease_ms: i64) -> Result<Option<Deployment>> {
        let now = now_ms();
        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            UPDATE deployments
            SET status = 'provisioning',
                active_task = 'destroy',
                lease_owner = ?,
                lease_expires_at = ?,
                started_at = COALESCE(started_at, ?),
                updated_at = ?
            WHERE id = (
                SELECT id FROM deployments
                WHERE ((status = 'running' AND cancel_requested_at IS NOT NULL)
                    OR (status = 'provisioning' AND active_task = 'destroy'))
                  AND (lease_owner IS NULL OR lease_expires_at < ?)
                ORDER BY COALESCE(cancel_requested_at, updated_at) ASC
                LIMIT 1
            )
              AND ((status = 'running' AND cancel_requested_at IS NOT NULL)
                OR (status = 'provisioning' AND active_task = 'destroy'))
              AND (lease_owner IS NULL OR lease_expires_at < ?)
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now + lease_ms)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Heartbeat: extend the lease if this worker still holds it. A `false`
    /// return is a fatal loss-of-lease for the caller.
    pub async fn renew_lease(&mut self, id: DeploymentId, worker_id: &str, lease_ms: i64) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET lease_expires_at = ?, updated_at = ?
            WHERE id = ? AND status = 'provisioning' AND lease_owner = ?
            "#,
        )
        .bind(now + lease_ms)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reclaim provision jobs whose lease expired. Rows with attached
    /// resources (or a pending cancel) are switched to destroy; the rest
    /// fail outright.
    #[instrument(skip(self), err)]
    pub async fn recover_stale_leases(&mut self) -> Result<Vec<(DeploymentId, RecoveryAction)>> {
        let now = now_ms();
        let stale = sqlx::query_as::<_, DeploymentRow>(
            r#"
            SELECT * FROM deployments
            WHERE status = 'provisioning' AND active_task = 'provision'
              AND lease_expires_at IS NOT NULL AND lease_expires_at < ?
            "#,
        )
        .bind(now)
        .fetch_all(&mut *self.db)
        .await?;

        let mut recovered = Vec::new();
        for row in stale {
            let deployment: Deployment = row.into();
            let needs_destroy = deployment.has_resources() || deployment.cancel_requested_at.is_some();

            if needs_destroy {
                let result = sqlx::query(
                    r#"
                    UPDATE deployments
                    SET active_task = 'destroy', lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
                    WHERE id = ? AND status = 'provisioning' AND active_task = 'provision'
                      AND lease_expires_at IS NOT NULL AND lease_expires_at < ?
                    "#,
                )
                .bind(now)
                .bind(deployment.id)
                .bind(now)
                .execute(&mut *self.db)
                .await?;

                if result.rows_affected() > 0 {
                    self.append_event(
                        deployment.id,
                        "recovered.destroy_queued",
                        "worker lease expired; queued cleanup of attached resources",
                        None,
                    )
                    .await?;
                    recovered.push((deployment.id, RecoveryAction::DestroyQueued));
                }
            } else {
                let result = sqlx::query(
                    r#"
                    UPDATE deployments
                    SET status = 'failed', active_task = NULL, lease_owner = NULL, lease_expires_at = NULL,
                        error_message = ?, completed_at = COALESCE(completed_at, ?), updated_at = ?
                    WHERE id = ? AND status = 'provisioning' AND active_task = 'provision'
                      AND lease_expires_at IS NOT NULL AND lease_expires_at < ?
                    "#,
                )
                .bind(LEASE_EXPIRED_MESSAGE)
                .bind(now)
                .bind(now)
                .bind(deployment.id)
                .bind(now)
                .execute(&mut *self.db)
                .await?;

                if result.rows_affected() > 0 {
                    recovered.push((deployment.id, RecoveryAction::Failed));
                }
            }
        }

        Ok(recovered)
    }

    /// Persist provider resource handles. Fenced by worker id; `None` means
    /// the lease was lost.
    #[instrument(skip(self, update), fields(deployment_id = %abbrev_uuid(&id)), err)]
    pub async fn update_resource_state(
        &mut self,
        id: DeploymentId,
        worker_id: &str,
        update: &ResourceStateUpdate,
    ) -> Result<Option<Deployment>> {
        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            UPDATE deployments SET
                server_id   = CASE WHEN ? THEN ? ELSE server_id END,
                server_name = CASE WHEN ? THEN ? ELSE server_name END,
                public_ip   = CASE WHEN ? THEN ? ELSE public_ip END,
                ssh_key_id  = CASE WHEN ? THEN ? ELSE ssh_key_id END,
                tailnet_url = CASE WHEN ? THEN ? ELSE tailnet_url END,
                updated_at = ?
            WHERE id = ? AND status = 'provisioning' AND lease_owner = ?
            RETURNING *
            "#,
        )
        .bind(update.server_id.is_some())
        .bind(update.server_id.clone().flatten())
        .bind(update.server_name.is_some())
        .bind(update.server_name.clone().flatten())
        .bind(update.public_ip.is_some())
        .bind(update.public_ip.clone().flatten())
        .bind(update.ssh_key_id.is_some())
        .bind(update.ssh_key_id.clone().flatten())
        .bind(update.tailnet_url.is_some())
        .bind(update.tailnet_url.clone().flatten())
        .bind(now_ms())
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Provision success: transition to `running` with the encrypted gateway
    /// token. Fenced by worker id and the provision task.
    #[instrument(skip(self, gateway_token_enc), fields(deployment_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_running(&mut self, id: DeploymentId, worker_id: &str, gateway_token_enc: &str) -> Result<Option<Deployment>> {
        let now = now_ms();
        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            UPDATE deployments
            SET status = 'running', active_task = NULL, lease_owner = NULL, lease_expires_at = NULL,
                gateway_token_enc = ?, error_message = NULL,
                completed_at = COALESCE(completed_at, ?), updated_at = ?
            WHERE id = ? AND status = 'provisioning' AND active_task = 'provision' AND lease_owner = ?
            RETURNING *
            "#,
        )
        .bind(gateway_token_enc)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Cancel-initiated cleanup finished with no residual errors while the
    /// provision task held the lease.
    #[instrument(skip(self), fields(deployment_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_canceled_from_provisioning(&mut self, id: DeploymentId, worker_id: &str) -> Result<Option<Deployment>> {
        let now = now_ms();
        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            UPDATE deployments
            SET status = 'canceled', active_task = NULL, lease_owner = NULL, lease_expires_at = NULL,
                completed_at = COALESCE(completed_at, ?), updated_at = ?
            WHERE id = ? AND status = 'provisioning' AND active_task = 'provision' AND lease_owner = ?
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(row.map(Into::into))
    }

    /// A standalone destroy job finished cleanly.
    #[instrument(skip(self), fields(deployment_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_canceled_from_destroy(&mut self, id: DeploymentId, worker_id: &str) -> Result<Option<Deployment>> {
        let now = now_ms();
        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            UPDATE deployments
            SET status = 'canceled', active_task = NULL, lease_owner = NULL, lease_expires_at = NULL,
                completed_at = COALESCE(completed_at, ?), updated_at = ?
            WHERE id = ? AND status = 'provisioning' AND active_task = 'destroy' AND lease_owner = ?
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Worker-fenced failure with a bounded message.
    #[instrument(skip(self, message), fields(deployment_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_failed(&mut self, id: DeploymentId, worker_id: &str, message: &str) -> Result<Option<Deployment>> {
        let now = now_ms();
        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            UPDATE deployments
            SET status = 'failed', active_task = NULL, lease_owner = NULL, lease_expires_at = NULL,
                error_message = ?, completed_at = COALESCE(completed_at, ?), updated_at = ?
            WHERE id = ? AND status = 'provisioning' AND lease_owner = ?
            RETURNING *
            "#,
        )
        .bind(clamp_error(message))
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Owner-scoped cancel. Three outcomes: a pending deployment cancels
    /// immediately (no resources exist yet); provisioning/running rows get
    /// the cancel flag for the scheduler to act on; terminal rows are a
    /// no-op. `None` when the owner has no such deployment.
    #[instrument(skip(self), fields(deployment_id = %abbrev_uuid(&id), owner = %owner), err)]
    pub async fn request_cancel(&mut self, owner: &UserId, id: DeploymentId) -> Result<Option<Deployment>> {
        let now = now_ms();

        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            UPDATE deployments
            SET status = 'canceled', active_task = NULL,
                completed_at = COALESCE(completed_at, ?), updated_at = ?
            WHERE id = ? AND owner_user_id = ? AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(owner)
        .fetch_optional(&mut *self.db)
        .await?;

        if let Some(row) = row {
            return Ok(Some(row.into()));
        }

        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            UPDATE deployments
            SET cancel_requested_at = COALESCE(cancel_requested_at, ?), updated_at = ?
            WHERE id = ? AND owner_user_id = ? AND status IN ('provisioning', 'running')
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(owner)
        .fetch_optional(&mut *self.db)
        .await?;

        match row {
            Some(row) => Ok(Some(row.into())),
            // Terminal rows fall through as a no-op on the current state
            None => self.get_owned(owner, id).await,
        }
    }

    /// Owner-scoped retry. Only `failed`/`canceled` rows with no attached
    /// provider handles return to `pending`; everything about the previous
    /// run (lease, cancel flag, timings, tailnet URL, gateway token, error)
    /// is cleared. The caller distinguishes a conflict from a miss by the
    /// status of the returned row.
    #[instrument(skip(self), fields(deployment_id = %abbrev_uuid(&id), owner = %owner), err)]
    pub async fn retry(&mut self, owner: &UserId, id: DeploymentId) -> Result<Option<Deployment>> {
        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            UPDATE deployments
            SET status = 'pending', active_task = NULL,
                lease_owner = NULL, lease_expires_at = NULL,
                cancel_requested_at = NULL,
                started_at = NULL, completed_at = NULL,
                tailnet_url = NULL, gateway_token_enc = NULL,
                error_message = NULL,
                updated_at = ?
            WHERE id = ? AND owner_user_id = ?
              AND status IN ('failed', 'canceled')
              AND server_id IS NULL AND ssh_key_id IS NULL
            RETURNING *
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .bind(owner)
        .fetch_optional(&mut *self.db)
        .await?;

        match row {
            Some(row) => Ok(Some(row.into())),
            None => self.get_owned(owner, id).await,
        }
    }

    /// Append an audit event.
    pub async fn append_event(
        &mut self,
        deployment_id: DeploymentId,
        event_type: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<DeploymentEvent> {
        let event = sqlx::query_as::<_, DeploymentEvent>(
            r#"
            INSERT INTO deployment_events (deployment_id, event_type, message, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(deployment_id)
        .bind(event_type)
        .bind(message)
        .bind(payload.map(|p| p.to_string()))
        .bind(now_ms())
        .fetch_one(&mut *self.db)
        .await?;

        Ok(event)
    }

    /// Events in append order (monotonic event id).
    pub async fn list_events(&mut self, deployment_id: DeploymentId) -> Result<Vec<DeploymentEvent>> {
        let events = sqlx::query_as::<_, DeploymentEvent>("SELECT * FROM deployment_events WHERE deployment_id = ? ORDER BY id ASC")
            .bind(deployment_id)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(events)
    }
}
