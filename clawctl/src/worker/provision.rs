//! The provision and destroy protocols.
//!
//! Both protocols run under a lease. The worker renews the lease before
//! every external side effect and checks the cancel flag before each one; a
//! heartbeat that matches no rows means the lease was lost and the protocol
//! aborts with no further writes (stale-lease recovery owns the row now).
//! Every failure path funnels into the cleanup path, which deletes whatever
//! provider resources were attached and settles the row into `canceled` or
//! `failed`.

use crate::api::models::deployments::{DeploymentConfig, DeploymentSecrets};
use crate::crypto::generate_gateway_token;
use crate::db::handlers::Deployments;
use crate::db::models::deployments::{Deployment, ResourceStateUpdate};
use crate::provisioner::{CreateServerRequest, ProvisionerError};
use crate::types::{DeploymentId, abbrev_uuid};
use crate::worker::WorkerContext;
use std::time::Duration;
use tracing::{info, warn};

/// Internal control flow for a protocol run.
#[derive(Debug)]
pub(super) enum WorkerError {
    /// Heartbeat affected zero rows; another worker owns the row now.
    LeaseLost,
    /// The cancel flag was observed; abort into the cleanup path.
    CancelRequested,
    /// Anything else fatal; abort into the cleanup path with this message.
    Fatal(String),
}

impl From<crate::db::errors::DbError> for WorkerError {
    fn from(e: crate::db::errors::DbError) -> Self {
        WorkerError::Fatal(format!("store error: {e}"))
    }
}

type StepResult<T> = std::result::Result<T, WorkerError>;

impl WorkerContext {
    async fn heartbeat(&self, id: DeploymentId) -> StepResult<()> {
        let mut conn = self.db.acquire().await.map_err(|e| WorkerError::Fatal(e.to_string()))?;
        let renewed = Deployments::new(&mut conn)
            .renew_lease(id, &self.worker_id, self.config.worker.lease_ms)
            .await?;
        if renewed { Ok(()) } else { Err(WorkerError::LeaseLost) }
    }

    async fn check_cancel(&self, id: DeploymentId) -> StepResult<()> {
        let mut conn = self.db.acquire().await.map_err(|e| WorkerError::Fatal(e.to_string()))?;
        let current = Deployments::new(&mut conn)
            .get_by_id(id)
            .await?
            .ok_or_else(|| WorkerError::Fatal("deployment row disappeared".to_string()))?;
        if current.cancel_requested_at.is_some() {
            Err(WorkerError::CancelRequested)
        } else {
            Ok(())
        }
    }

    /// Heartbeat, then check cancel: the gate before every external side
    /// effect.
    async fn gate(&self, id: DeploymentId) -> StepResult<()> {
        self.heartbeat(id).await?;
        self.check_cancel(id).await
    }

    async fn record(&self, id: DeploymentId, event_type: &str, message: &str) {
        let Ok(mut conn) = self.db.acquire().await else { return };
        if let Err(e) = Deployments::new(&mut conn).append_event(id, event_type, message, None).await {
            warn!(deployment_id = %abbrev_uuid(&id), error = %e, "Failed to append deployment event");
            return;
        }
        self.hooks.event_appended(id, event_type);
    }

    async fn persist_resources(&self, id: DeploymentId, update: ResourceStateUpdate) -> StepResult<()> {
        let mut conn = self.db.acquire().await.map_err(|e| WorkerError::Fatal(e.to_string()))?;
        let updated = Deployments::new(&mut conn).update_resource_state(id, &self.worker_id, &update).await?;
        if updated.is_none() {
            return Err(WorkerError::LeaseLost);
        }
        self.hooks.deployment_changed(id);
        Ok(())
    }

    /// Run the full provision protocol for a freshly leased deployment.
    pub(super) async fn run_provision(&self, deployment: Deployment) {
        let id = deployment.id;
        info!(deployment_id = %abbrev_uuid(&id), "Provision protocol starting");
        self.record(id, "provision.started", "provision protocol started").await;

        match self.provision_steps(&deployment).await {
            Ok(()) => {
                info!(deployment_id = %abbrev_uuid(&id), "Provision protocol completed");
            }
            Err(WorkerError::LeaseLost) => {
                warn!(deployment_id = %abbrev_uuid(&id), "Lost lease mid-provision, aborting without writes");
            }
            Err(WorkerError::CancelRequested) => {
                info!(deployment_id = %abbrev_uuid(&id), "Cancel observed mid-provision, entering cleanup");
                self.cleanup(id, true, None).await;
            }
            Err(WorkerError::Fatal(message)) => {
                warn!(deployment_id = %abbrev_uuid(&id), error = %message, "Provision failed, entering cleanup");
                self.cleanup(id, false, Some(message)).await;
            }
        }
    }

    async fn provision_steps(&self, deployment: &Deployment) -> StepResult<()> {
        let id = deployment.id;

        // 1. Decrypt the stored envelopes; reject if required fields missing.
        let config: DeploymentConfig = self
            .cipher
            .decrypt(&deployment.config_enc)
            .map_err(|_| WorkerError::Fatal("stored payload cannot be decrypted".to_string()))?;
        let secrets: DeploymentSecrets = self
            .cipher
            .decrypt(&deployment.secrets_enc)
            .map_err(|_| WorkerError::Fatal("stored payload cannot be decrypted".to_string()))?;

        let api_key = secrets
            .api_key_for(config.auth_choice)
            .ok_or_else(|| WorkerError::Fatal("secrets envelope missing required API key".to_string()))?
            .to_string();

        // 2. Register a host key under a worker-unique name.
        self.gate(id).await?;
        let public_key = tokio::fs::read_to_string(&self.config.bootstrap.ssh_public_key_path)
            .await
            .map_err(|e| WorkerError::Fatal(format!("cannot read bootstrap public key: {e}")))?;
        let key_name = format!("{}-{}", deployment.name, abbrev_uuid(&id));
        let ssh_key = self
            .provisioner
            .register_ssh_key(&key_name, public_key.trim())
            .await
            .map_err(|e| WorkerError::Fatal(format!("host key registration failed: {e}")))?;
        self.persist_resources(
            id,
            ResourceStateUpdate {
                ssh_key_id: Some(Some(ssh_key.id.clone())),
                ..Default::default()
            },
        )
        .await?;

        // 3. Create the server with the plan-specific shape; persist handles
        // as soon as the create call returns.
        self.gate(id).await?;
        let server_type = deployment
            .metadata
            .get("planId")
            .and_then(|v| v.as_str())
            .and_then(|plan_id| self.config.plan(plan_id))
            .and_then(|plan| plan.server_type.clone())
            .unwrap_or_else(|| self.config.provisioner.server_type.clone());

        let created = self
            .provisioner
            .create_server(&CreateServerRequest {
                name: key_name.clone(),
                server_type,
                image: self.config.provisioner.image.clone(),
                location: self.config.provisioner.location.clone(),
                ssh_key_id: ssh_key.id.clone(),
                labels: vec![("managed-by".to_string(), "clawctl".to_string())],
            })
            .await
            .map_err(|e| WorkerError::Fatal(format!("server creation failed: {e}")))?;
        self.persist_resources(
            id,
            ResourceStateUpdate {
                server_id: Some(Some(created.id.clone())),
                server_name: Some(Some(created.name.clone())),
                public_ip: Some(created.public_ip.clone()),
                ..Default::default()
            },
        )
        .await?;
        self.record(id, "server.created", "compute server created").await;

        // 4. Wait out the provider action, heartbeating through the wait.
        if let Some(action_id) = created.action_id {
            self.wait_action_with_heartbeat(id, action_id).await?;
        }

        // 5. Fetch until a public IPv4 is assigned.
        let ip = match created.public_ip {
            Some(ip) => ip,
            None => self.await_public_ip(id, &created.id).await?,
        };
        self.persist_resources(
            id,
            ResourceStateUpdate {
                public_ip: Some(Some(ip.clone())),
                ..Default::default()
            },
        )
        .await?;
        self.record(id, "server.ip_assigned", "public address assigned").await;

        // 6. Await SSH readiness.
        self.await_ssh_ready(id, &ip).await?;

        // 7. Execute the bootstrap with a minimal environment from the
        // decrypted secrets.
        self.gate(id).await?;
        let mut env = vec![("CLAW_NAME".to_string(), config.name.clone())];
        match config.auth_choice {
            crate::api::models::deployments::AuthChoice::Anthropic => env.push(("ANTHROPIC_API_KEY".to_string(), api_key)),
            crate::api::models::deployments::AuthChoice::Openai => env.push(("OPENAI_API_KEY".to_string(), api_key)),
        }
        if let Some(token) = &secrets.discord_bot_token {
            env.push(("DISCORD_BOT_TOKEN".to_string(), token.clone()));
        }
        if let Some(key) = &secrets.tailscale_auth_key {
            env.push(("TAILSCALE_AUTH_KEY".to_string(), key.clone()));
        }
        if let Some(guild) = &config.discord_guild_id {
            env.push(("DISCORD_GUILD_ID".to_string(), guild.clone()));
        }
        if !config.discord_channels.is_empty() {
            env.push(("DISCORD_CHANNELS".to_string(), config.discord_channels.join(",")));
        }

        self.bootstrap
            .run_bootstrap(&ip, &env)
            .await
            .map_err(|e| WorkerError::Fatal(format!("bootstrap failed: {e}")))?;
        self.record(id, "bootstrap.completed", "bootstrap script completed").await;

        // 8. Best-effort tailnet discovery; the absence is persisted too.
        self.heartbeat(id).await?;
        let tailnet = self.bootstrap.discover_tailnet_host(&ip).await;
        self.persist_resources(
            id,
            ResourceStateUpdate {
                tailnet_url: Some(tailnet),
                ..Default::default()
            },
        )
        .await?;

        // 9. Mint the gateway token and finish.
        let token_enc = self
            .cipher
            .encrypt(&generate_gateway_token())
            .map_err(|e| WorkerError::Fatal(format!("gateway token encryption failed: {e}")))?;
        self.heartbeat(id).await?;
        let mut conn = self.db.acquire().await.map_err(|e| WorkerError::Fatal(e.to_string()))?;
        let finished = Deployments::new(&mut conn).mark_running(id, &self.worker_id, &token_enc).await?;
        if finished.is_none() {
            return Err(WorkerError::LeaseLost);
        }
        drop(conn);

        self.record(id, "provision.completed", "deployment is running").await;
        self.hooks.deployment_changed(id);
        Ok(())
    }

    /// Wait for a provider action, renewing the lease at least every
    /// `lease_ms / 3`.
    async fn wait_action_with_heartbeat(&self, id: DeploymentId, action_id: i64) -> StepResult<()> {
        let chunk = self.heartbeat_interval();
        let deadline = tokio::time::Instant::now() + self.config.provisioner.action_timeout;

        loop {
            self.gate(id).await?;
            match self.provisioner.wait_for_action(action_id, chunk).await {
                Ok(()) => return Ok(()),
                Err(ProvisionerError::Timeout { .. }) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(WorkerError::Fatal(format!("provider action {action_id} did not complete in time")));
                    }
                }
                Err(e) => return Err(WorkerError::Fatal(format!("provider action failed: {e}"))),
            }
        }
    }

    async fn await_public_ip(&self, id: DeploymentId, server_id: &str) -> StepResult<String> {
        let deadline = tokio::time::Instant::now() + self.config.provisioner.ip_timeout;

        loop {
            self.gate(id).await?;
            let server = self
                .provisioner
                .get_server(server_id)
                .await
                .map_err(|e| WorkerError::Fatal(format!("server fetch failed: {e}")))?;
            if let Some(ip) = server.public_ip {
                return Ok(ip);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WorkerError::Fatal("no public address assigned in time".to_string()));
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
    }

    async fn await_ssh_ready(&self, id: DeploymentId, ip: &str) -> StepResult<()> {
        let deadline = tokio::time::Instant::now() + self.config.bootstrap.ssh_ready_timeout;
        let pause = Duration::from_secs(5).min(self.heartbeat_interval());

        loop {
            self.gate(id).await?;
            if self.bootstrap.probe_ssh(ip).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WorkerError::Fatal("host never became reachable over SSH".to_string()));
            }
            tokio::time::sleep(pause).await;
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.config.worker.lease_ms / 3).max(1) as u64)
    }

    /// Run a leased destroy job: delete resources, settle the row.
    pub(super) async fn run_destroy(&self, deployment: Deployment) {
        let id = deployment.id;
        info!(deployment_id = %abbrev_uuid(&id), "Destroy protocol starting");
        self.record(id, "destroy.started", "cleanup of provider resources started").await;

        let errors = self.delete_resources(id).await;
        match errors {
            Err(WorkerError::LeaseLost) => {
                warn!(deployment_id = %abbrev_uuid(&id), "Lost lease mid-destroy, aborting");
            }
            Err(other) => {
                // delete_resources only aborts for lease loss; anything else
                // is collected, but be safe.
                warn!(deployment_id = %abbrev_uuid(&id), error = ?other, "Destroy aborted");
            }
            Ok(resource_errors) => {
                let mut conn = match self.db.acquire().await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "Failed to settle destroy outcome");
                        return;
                    }
                };
                let mut repo = Deployments::new(&mut conn);
                let settled = if resource_errors.is_empty() {
                    repo.mark_canceled_from_destroy(id, &self.worker_id).await
                } else {
                    repo.mark_failed(id, &self.worker_id, &resource_errors.join("; ")).await
                };
                drop(conn);

                match settled {
                    Ok(Some(_)) => {
                        self.record(id, "destroy.completed", "provider resources cleaned up").await;
                        self.hooks.deployment_changed(id);
                    }
                    Ok(None) => warn!(deployment_id = %abbrev_uuid(&id), "Lost lease settling destroy"),
                    Err(e) => warn!(deployment_id = %abbrev_uuid(&id), error = %e, "Failed to settle destroy"),
                }
            }
        }
    }

    /// The cleanup path shared by failed and canceled provisions.
    pub(super) async fn cleanup(&self, id: DeploymentId, cancel_initiated: bool, base_error: Option<String>) {
        let resource_errors = match self.delete_resources(id).await {
            Ok(errors) => errors,
            Err(WorkerError::LeaseLost) => {
                warn!(deployment_id = %abbrev_uuid(&id), "Lost lease mid-cleanup, aborting");
                return;
            }
            Err(other) => {
                warn!(deployment_id = %abbrev_uuid(&id), error = ?other, "Cleanup aborted");
                return;
            }
        };

        let mut composed: Vec<String> = base_error.into_iter().collect();
        composed.extend(resource_errors);

        let mut conn = match self.db.acquire().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to settle cleanup outcome");
                return;
            }
        };
        let mut repo = Deployments::new(&mut conn);
        let settled = if cancel_initiated && composed.is_empty() {
            repo.mark_canceled_from_provisioning(id, &self.worker_id).await
        } else {
            let message = if composed.is_empty() {
                "provisioning aborted".to_string()
            } else {
                composed.join("; ")
            };
            repo.mark_failed(id, &self.worker_id, &message).await
        };
        drop(conn);

        match settled {
            Ok(Some(d)) => {
                self.record(id, "cleanup.completed", &format!("cleanup finished, deployment {}", d.status.to_db_string()))
                    .await;
                self.hooks.deployment_changed(id);
            }
            Ok(None) => warn!(deployment_id = %abbrev_uuid(&id), "Lost lease settling cleanup"),
            Err(e) => warn!(deployment_id = %abbrev_uuid(&id), error = %e, "Failed to settle cleanup"),
        }
    }

    /// Delete whatever provider resources the row still references and clear
    /// the handles. Provider "not found" counts as success; other provider
    /// errors are collected per resource.
    async fn delete_resources(&self, id: DeploymentId) -> StepResult<Vec<String>> {
        let mut errors = Vec::new();

        let current = {
            let mut conn = self.db.acquire().await.map_err(|e| WorkerError::Fatal(e.to_string()))?;
            Deployments::new(&mut conn)
                .get_by_id(id)
                .await?
                .ok_or_else(|| WorkerError::Fatal("deployment row disappeared".to_string()))?
        };

        if let Some(server_id) = &current.server_id {
            self.heartbeat(id).await?;
            match self.provisioner.delete_server(server_id).await {
                Ok(()) | Err(ProvisionerError::NotFound) => {
                    self.persist_resources(
                        id,
                        ResourceStateUpdate {
                            server_id: Some(None),
                            server_name: Some(None),
                            public_ip: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
                }
                Err(e) => errors.push(format!("server delete failed: {e}")),
            }
        }

        if let Some(ssh_key_id) = &current.ssh_key_id {
            self.heartbeat(id).await?;
            match self.provisioner.remove_ssh_key(ssh_key_id).await {
                Ok(()) | Err(ProvisionerError::NotFound) => {
                    self.persist_resources(
                        id,
                        ResourceStateUpdate {
                            ssh_key_id: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
                }
                Err(e) => errors.push(format!("host key removal failed: {e}")),
            }
        }

        Ok(errors)
    }
}
