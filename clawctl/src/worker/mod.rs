//! Background deployment scheduler.
//!
//! One scheduler runs per process as a periodic task. A tick never overlaps
//! a slow predecessor (re-entrancy guard), and each tick does at most one
//! job: recover stale leases, else lease and run one destroy job, else lease
//! and run one provision job. Concurrent processes sharing the store are
//! safe because leasing is a single predicated UPDATE.
//!
//! `tick()` is public so tests (and operators) can drive the scheduler
//! deterministically with the daemon disabled.

pub mod bootstrap;
mod provision;

pub use bootstrap::{BootstrapRunner, OpenSshRunner};

use crate::config::Config;
use crate::crypto::Cipher;
use crate::db::handlers::Deployments;
use crate::db::hooks::StoreHooks;
use crate::provisioner::ProvisionerClient;
use crate::types::{DeploymentId, generate_worker_id};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Shared state for protocol execution.
pub struct WorkerContext {
    pub db: SqlitePool,
    pub cipher: Cipher,
    pub provisioner: Arc<dyn ProvisionerClient>,
    pub bootstrap: Arc<dyn BootstrapRunner>,
    pub hooks: StoreHooks,
    pub config: Config,
    pub worker_id: String,
}

/// What a single tick did. Observable so tests can assert scheduler
/// behavior without races.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick is still running.
    Skipped,
    /// Nothing to do.
    Idle,
    /// Stale leases were reclaimed; job leasing waits for the next tick.
    Recovered(usize),
    RanDestroy(DeploymentId),
    RanProvision(DeploymentId),
}

#[derive(Clone)]
pub struct Scheduler {
    ctx: Arc<WorkerContext>,
    tick_guard: Arc<tokio::sync::Mutex<()>>,
}

impl Scheduler {
    pub fn new(
        db: SqlitePool,
        config: Config,
        cipher: Cipher,
        provisioner: Arc<dyn ProvisionerClient>,
        bootstrap: Arc<dyn BootstrapRunner>,
        hooks: StoreHooks,
    ) -> Self {
        let worker_id = generate_worker_id();
        info!(%worker_id, "Scheduler created");

        Self {
            ctx: Arc::new(WorkerContext {
                db,
                cipher,
                provisioner,
                bootstrap,
                hooks,
                config,
                worker_id,
            }),
            tick_guard: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.ctx.worker_id
    }

    /// One scheduler pass. Returns immediately if a previous tick is still
    /// running.
    pub async fn tick(&self) -> anyhow::Result<TickOutcome> {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            debug!("Previous tick still running, skipping");
            return Ok(TickOutcome::Skipped);
        };

        let lease_ms = self.ctx.config.worker.lease_ms;

        let (destroy, provision) = {
            let mut conn = self.ctx.db.acquire().await?;
            let mut repo = Deployments::new(&mut conn);

            let recovered = repo.recover_stale_leases().await?;
            if !recovered.is_empty() {
                for (id, action) in &recovered {
                    debug!(deployment_id = %id, ?action, "Recovered stale lease");
                    self.ctx.hooks.deployment_changed(*id);
                }
                // Recovered jobs become leaseable on the next tick.
                return Ok(TickOutcome::Recovered(recovered.len()));
            }

            let destroy = repo.lease_destroy(&self.ctx.worker_id, lease_ms).await?;
            let provision = if destroy.is_none() {
                repo.lease_provision(&self.ctx.worker_id, lease_ms).await?
            } else {
                None
            };
            (destroy, provision)
        };

        if let Some(deployment) = destroy {
            let id = deployment.id;
            self.ctx.hooks.deployment_changed(id);
            self.ctx.run_destroy(deployment).await;
            return Ok(TickOutcome::RanDestroy(id));
        }

        if let Some(deployment) = provision {
            let id = deployment.id;
            self.ctx.hooks.deployment_changed(id);
            self.ctx.run_provision(deployment).await;
            return Ok(TickOutcome::RanProvision(id));
        }

        Ok(TickOutcome::Idle)
    }

    /// Run the scheduler until shutdown. Missed ticks are skipped, not
    /// bunched.
    pub async fn run_daemon(self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.ctx.worker_id,
            interval = ?self.ctx.config.worker.tick_interval,
            "Scheduler daemon starting"
        );

        let mut interval = tokio::time::interval(self.ctx.config.worker.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Idle) | Ok(TickOutcome::Skipped) => {}
                        Ok(outcome) => debug!(?outcome, "Scheduler tick"),
                        Err(e) => error!("Scheduler tick failed: {e:#}"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping scheduler daemon");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::models::deployments::{AuthChoice, DeploymentConfig, DeploymentSecrets, DiscordGroupPolicy};
    use crate::db::models::deployments::{ActiveTask, Deployment, DeploymentCreateDBRequest, DeploymentStatus};
    use crate::provisioner::{CreateServerRequest, CreatedServer, ProvisionerError, Server, SshKeyHandle};
    use crate::types::now_ms;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Recording mock for the cloud provider.
    #[derive(Default)]
    pub struct MockProvisioner {
        pub created_servers: Mutex<Vec<CreateServerRequest>>,
        pub deleted_servers: Mutex<Vec<String>>,
        pub removed_keys: Mutex<Vec<String>>,
        pub fail_create_server: AtomicBool,
        pub delete_reports_not_found: AtomicBool,
        /// When set, a server create flips the cancel flag on every
        /// deployment row, simulating an operator cancel racing the worker.
        pub cancel_pool: Mutex<Option<SqlitePool>>,
        next_server_id: AtomicU32,
    }

    #[async_trait]
    impl crate::provisioner::ProvisionerClient for MockProvisioner {
        async fn register_ssh_key(&self, _name: &str, _public_key: &str) -> crate::provisioner::Result<SshKeyHandle> {
            Ok(SshKeyHandle { id: "key-1".to_string() })
        }

        async fn remove_ssh_key(&self, id: &str) -> crate::provisioner::Result<()> {
            self.removed_keys.lock().unwrap().push(id.to_string());
            if self.delete_reports_not_found.load(Ordering::SeqCst) {
                return Err(ProvisionerError::NotFound);
            }
            Ok(())
        }

        async fn create_server(&self, request: &CreateServerRequest) -> crate::provisioner::Result<CreatedServer> {
            if self.fail_create_server.load(Ordering::SeqCst) {
                return Err(ProvisionerError::Api {
                    status: 422,
                    message: "resource_unavailable".to_string(),
                });
            }
            self.created_servers.lock().unwrap().push(request.clone());

            let cancel_pool = self.cancel_pool.lock().unwrap().clone();
            if let Some(pool) = cancel_pool {
                sqlx::query("UPDATE deployments SET cancel_requested_at = ?")
                    .bind(now_ms())
                    .execute(&pool)
                    .await
                    .unwrap();
            }

            let n = self.next_server_id.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CreatedServer {
                id: format!("srv-{n}"),
                name: request.name.clone(),
                public_ip: Some("203.0.113.7".to_string()),
                action_id: None,
            })
        }

        async fn delete_server(&self, id: &str) -> crate::provisioner::Result<()> {
            self.deleted_servers.lock().unwrap().push(id.to_string());
            if self.delete_reports_not_found.load(Ordering::SeqCst) {
                return Err(ProvisionerError::NotFound);
            }
            Ok(())
        }

        async fn get_server(&self, id: &str) -> crate::provisioner::Result<Server> {
            Ok(Server {
                id: id.to_string(),
                name: "mock".to_string(),
                public_ip: Some("203.0.113.7".to_string()),
            })
        }

        async fn wait_for_action(&self, _action_id: i64, _timeout: std::time::Duration) -> crate::provisioner::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockBootstrap {
        pub fail_bootstrap: AtomicBool,
        pub bootstrap_envs: Mutex<Vec<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl BootstrapRunner for MockBootstrap {
        async fn probe_ssh(&self, _ip: &str) -> bool {
            true
        }

        async fn run_bootstrap(&self, _ip: &str, env: &[(String, String)]) -> bootstrap::Result<()> {
            if self.fail_bootstrap.load(Ordering::SeqCst) {
                return Err(bootstrap::BootstrapError::NonZeroExit(1));
            }
            self.bootstrap_envs.lock().unwrap().push(env.to_vec());
            Ok(())
        }

        async fn discover_tailnet_host(&self, _ip: &str) -> Option<String> {
            Some("https://claw-test.tailnet.example".to_string())
        }
    }

    pub struct Harness {
        pub scheduler: Scheduler,
        pub provisioner: Arc<MockProvisioner>,
        pub bootstrap: Arc<MockBootstrap>,
        pub cipher: Cipher,
        pub pool: SqlitePool,
        _key_file: tempfile::NamedTempFile,
    }

    pub fn harness(pool: SqlitePool) -> Harness {
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(key_file, "ssh-ed25519 AAAATESTKEY test@clawctl").unwrap();

        let mut config = Config::default();
        config.worker.lease_ms = 60_000;
        config.bootstrap.ssh_public_key_path = key_file.path().to_path_buf();

        let cipher = Cipher::new("worker test passphrase").unwrap();
        let provisioner = Arc::new(MockProvisioner::default());
        let bootstrap = Arc::new(MockBootstrap::default());

        let scheduler = Scheduler::new(
            pool.clone(),
            config,
            cipher.clone(),
            provisioner.clone(),
            bootstrap.clone(),
            StoreHooks::new(),
        );

        Harness {
            scheduler,
            provisioner,
            bootstrap,
            cipher,
            pool,
            _key_file: key_file,
        }
    }

    pub async fn queue_deployment(h: &Harness, owner: &str) -> Deployment {
        let config = DeploymentConfig {
            name: "claw-test".to_string(),
            auth_choice: AuthChoice::Anthropic,
            discord_group_policy: DiscordGroupPolicy::Open,
            discord_guild_id: None,
            discord_channels: vec![],
            metadata: Default::default(),
        };
        let secrets = DeploymentSecrets {
            anthropic_api_key: Some("sk-ant-worker-test".to_string()),
            openai_api_key: None,
            discord_bot_token: Some("bot-token".to_string()),
            tailscale_auth_key: None,
        };

        let mut conn = h.pool.acquire().await.unwrap();
        Deployments::new(&mut conn)
            .create(&DeploymentCreateDBRequest {
                name: config.name.clone(),
                owner_user_id: owner.to_string(),
                config_enc: h.cipher.encrypt(&config).unwrap(),
                secrets_enc: h.cipher.encrypt(&secrets).unwrap(),
                metadata: serde_json::json!({}),
                billing_ref: None,
            })
            .await
            .unwrap()
    }

    async fn fetch(h: &Harness, id: DeploymentId) -> Deployment {
        let mut conn = h.pool.acquire().await.unwrap();
        Deployments::new(&mut conn).get_by_id(id).await.unwrap().unwrap()
    }

    #[sqlx::test(migrations = "./migrations/deployments")]
    async fn test_tick_idle_when_empty(pool: SqlitePool) {
        let h = harness(pool);
        assert_eq!(h.scheduler.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[sqlx::test(migrations = "./migrations/deployments")]
    async fn test_happy_provision_path(pool: SqlitePool) {
        let h = harness(pool);
        let deployment = queue_deployment(&h, "tenant-a").await;

        let outcome = h.scheduler.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::RanProvision(deployment.id));

        let finished = fetch(&h, deployment.id).await;
        assert_eq!(finished.status, DeploymentStatus::Running);
        assert!(finished.active_task.is_none());
        assert!(finished.lease_owner.is_none());
        assert_eq!(finished.public_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(finished.ssh_key_id.as_deref(), Some("key-1"));
        assert!(finished.server_id.is_some());
        assert_eq!(finished.tailnet_url.as_deref(), Some("https://claw-test.tailnet.example"));

        // The gateway token decrypts back to a 32-byte base64url token
        let token: String = h.cipher.decrypt(finished.gateway_token_enc.as_deref().unwrap()).unwrap();
        assert_eq!(token.len(), 43);

        // The bootstrap saw the secrets-derived environment
        let envs = h.bootstrap.bootstrap_envs.lock().unwrap();
        let env = &envs[0];
        assert!(env.iter().any(|(k, v)| k == "ANTHROPIC_API_KEY" && v == "sk-ant-worker-test"));
        assert!(env.iter().any(|(k, v)| k == "DISCORD_BOT_TOKEN" && v == "bot-token"));
        assert!(env.iter().any(|(k, _)| k == "CLAW_NAME"));

        // Audit trail in append order
        let mut conn = h.pool.acquire().await.unwrap();
        let events = Deployments::new(&mut conn).list_events(deployment.id).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types.first(), Some(&"provision.started"));
        assert_eq!(types.last(), Some(&"provision.completed"));
    }

    #[sqlx::test(migrations = "./migrations/deployments")]
    async fn test_bootstrap_failure_cleans_up_and_fails(pool: SqlitePool) {
        let h = harness(pool);
        let deployment = queue_deployment(&h, "tenant-a").await;
        h.bootstrap.fail_bootstrap.store(true, Ordering::SeqCst);

        h.scheduler.tick().await.unwrap();

        let finished = fetch(&h, deployment.id).await;
        assert_eq!(finished.status, DeploymentStatus::Failed);
        assert!(finished.error_message.as_deref().unwrap().contains("bootstrap failed"));
        // Resources were deleted and their handles cleared
        assert!(finished.server_id.is_none());
        assert!(finished.ssh_key_id.is_none());
        assert_eq!(h.provisioner.deleted_servers.lock().unwrap().len(), 1);
        assert_eq!(h.provisioner.removed_keys.lock().unwrap().len(), 1);
    }

    #[sqlx::test(migrations = "./migrations/deployments")]
    async fn test_provider_not_found_counts_as_cleanup_success(pool: SqlitePool) {
        let h = harness(pool);
        let deployment = queue_deployment(&h, "tenant-a").await;
        h.bootstrap.fail_bootstrap.store(true, Ordering::SeqCst);
        h.provisioner.delete_reports_not_found.store(true, Ordering::SeqCst);

        h.scheduler.tick().await.unwrap();

        let finished = fetch(&h, deployment.id).await;
        assert_eq!(finished.status, DeploymentStatus::Failed);
        // 404s did not produce residual resource errors
        assert!(!finished.error_message.as_deref().unwrap().contains("delete failed"));
        assert!(finished.server_id.is_none());
        assert!(finished.ssh_key_id.is_none());
    }

    #[sqlx::test(migrations = "./migrations/deployments")]
    async fn test_cancel_mid_protocol_ends_canceled(pool: SqlitePool) {
        let h = harness(pool.clone());
        let deployment = queue_deployment(&h, "tenant-a").await;
        *h.provisioner.cancel_pool.lock().unwrap() = Some(pool);

        h.scheduler.tick().await.unwrap();

        let finished = fetch(&h, deployment.id).await;
        assert_eq!(finished.status, DeploymentStatus::Canceled);
        // Cleanup deleted what had been created before the cancel landed
        assert_eq!(h.provisioner.deleted_servers.lock().unwrap().len(), 1);
        assert!(finished.server_id.is_none());
    }

    #[sqlx::test(migrations = "./migrations/deployments")]
    async fn test_create_failure_fails_with_cleanup(pool: SqlitePool) {
        let h = harness(pool);
        let deployment = queue_deployment(&h, "tenant-a").await;
        h.provisioner.fail_create_server.store(true, Ordering::SeqCst);

        h.scheduler.tick().await.unwrap();

        let finished = fetch(&h, deployment.id).await;
        assert_eq!(finished.status, DeploymentStatus::Failed);
        assert!(finished.error_message.as_deref().unwrap().contains("server creation failed"));
        // Only the ssh key existed; it was removed
        assert_eq!(h.provisioner.removed_keys.lock().unwrap().len(), 1);
        assert!(finished.ssh_key_id.is_none());
    }

    #[sqlx::test(migrations = "./migrations/deployments")]
    async fn test_stale_lease_recovery_then_destroy(pool: SqlitePool) {
        // S6 shape: provisioning/provision, expired lease, server attached.
        let h = harness(pool.clone());
        let deployment = queue_deployment(&h, "tenant-a").await;
        sqlx::query(
            r#"
            UPDATE deployments
            SET status = 'provisioning', active_task = 'provision',
                lease_owner = 'worker-crashed', lease_expires_at = ?, server_id = 'srv-zombie'
            WHERE id = ?
            "#,
        )
        .bind(now_ms() - 5_000)
        .bind(deployment.id)
        .execute(&pool)
        .await
        .unwrap();

        // First tick only recovers
        assert_eq!(h.scheduler.tick().await.unwrap(), TickOutcome::Recovered(1));
        let mid = fetch(&h, deployment.id).await;
        assert_eq!(mid.active_task, Some(ActiveTask::Destroy));
        assert!(mid.lease_owner.is_none());

        // Second tick leases and runs the destroy job
        assert_eq!(h.scheduler.tick().await.unwrap(), TickOutcome::RanDestroy(deployment.id));
        let finished = fetch(&h, deployment.id).await;
        assert_eq!(finished.status, DeploymentStatus::Canceled);
        assert!(finished.server_id.is_none());
        assert_eq!(*h.provisioner.deleted_servers.lock().unwrap(), vec!["srv-zombie".to_string()]);
    }

    #[sqlx::test(migrations = "./migrations/deployments")]
    async fn test_cancel_running_leads_to_destroy(pool: SqlitePool) {
        let h = harness(pool.clone());
        let deployment = queue_deployment(&h, "tenant-a").await;

        // Provision to running
        h.scheduler.tick().await.unwrap();
        assert_eq!(fetch(&h, deployment.id).await.status, DeploymentStatus::Running);

        // Owner requests cancel; the next tick runs the destroy job
        let mut conn = pool.acquire().await.unwrap();
        Deployments::new(&mut conn)
            .request_cancel(&"tenant-a".to_string(), deployment.id)
            .await
            .unwrap()
            .unwrap();
        drop(conn);

        assert_eq!(h.scheduler.tick().await.unwrap(), TickOutcome::RanDestroy(deployment.id));
        let finished = fetch(&h, deployment.id).await;
        assert_eq!(finished.status, DeploymentStatus::Canceled);
        assert!(finished.server_id.is_none());
        assert!(finished.ssh_key_id.is_none());
    }

    #[sqlx::test(migrations = "./migrations/deployments")]
    async fn test_tick_guard_skips_overlap(pool: SqlitePool) {
        let h = harness(pool);
        let _held = h.scheduler.tick_guard.clone().try_lock_owned().unwrap();
        assert_eq!(h.scheduler.tick().await.unwrap(), TickOutcome::Skipped);
    }

    #[sqlx::test(migrations = "./migrations/deployments")]
    async fn test_undecryptable_secrets_fail_terminally(pool: SqlitePool) {
        let h = harness(pool.clone());
        let deployment = queue_deployment(&h, "tenant-a").await;
        sqlx::query("UPDATE deployments SET secrets_enc = 'v1.bad.bad.bad' WHERE id = ?")
            .bind(deployment.id)
            .execute(&pool)
            .await
            .unwrap();

        h.scheduler.tick().await.unwrap();

        let finished = fetch(&h, deployment.id).await;
        assert_eq!(finished.status, DeploymentStatus::Failed);
        assert!(finished.error_message.as_deref().unwrap().contains("cannot be decrypted"));
    }
}
