//! # clawctl: deployment control plane
//!
//! `clawctl` is a small control plane that accepts payment-gated or direct
//! requests to provision a single-tenant agent host on a cloud provider,
//! coordinates the background work, and exposes owner-scoped state to
//! operators.
//!
//! ## Overview
//!
//! A checkout request creates a billing order holding an encrypted
//! deployment intent and a hosted payment session. Webhooks from the payment
//! provider settle the order through a small state machine; a paid order is
//! bridged into a deployment record, which a background scheduler leases and
//! provisions: host key, server, SSH bootstrap, tailnet discovery, gateway
//! token. Cancellation and crash recovery run through the same lease
//! machinery, so a crashed worker's half-provisioned server is found and
//! destroyed rather than leaked.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum); persistence
//! is two SQLite databases driven through sqlx (orders and billing dedup
//! state in one, deployment lifecycle state in the other). All cross-worker
//! coordination goes through predicated updates in the store - there is no
//! in-process queue to lose on restart.
//!
//! The **billing layer** ([`billing`]) owns checkout orchestration (with
//! client-asserted idempotency keys), webhook intake (signature check on the
//! raw body, then at-most-once dispatch through a dedup table), and the
//! bridge that turns a paid order into a queued deployment.
//!
//! The **worker** ([`worker`]) is a periodic scheduler; each tick recovers
//! expired leases, then leases at most one destroy or provision job with a
//! single predicated UPDATE. Workers heartbeat their lease before every
//! external side effect, so a stalled worker loses the row cleanly.
//!
//! **External collaborators** sit behind narrow seams: the payment provider
//! ([`payments::PaymentGateway`]), the cloud API
//! ([`provisioner::ProvisionerClient`]), and the host bootstrap
//! ([`worker::BootstrapRunner`]).
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use clawctl::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = clawctl::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     clawctl::telemetry::init_telemetry();
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await
//! }
//! ```

pub mod api;
pub mod auth;
pub mod billing;
pub mod config;
pub mod crypto;
pub mod db;
pub mod errors;
mod fingerprint;
mod naming;
pub mod payments;
pub mod provisioner;
pub mod telemetry;
pub mod types;
pub mod worker;

#[cfg(test)]
mod test;

pub use config::Config;
pub use fingerprint::fingerprint;
pub use naming::normalize_label;

use crate::auth::AuthResolver;
use crate::crypto::Cipher;
use crate::db::hooks::StoreHooks;
use crate::payments::PaymentGateway;
use crate::payments::stripe::StripeGateway;
use crate::provisioner::hetzner::HetznerClient;
use crate::worker::{OpenSshRunner, Scheduler};
use axum::{
    Router,
    routing::{get, post},
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, instrument, warn};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orders_db: SqlitePool,
    pub deployments_db: SqlitePool,
    pub config: Config,
    pub cipher: Cipher,
    pub auth: Arc<AuthResolver>,
    pub gateway: Option<Arc<dyn PaymentGateway>>,
    pub hooks: StoreHooks,
}

/// Build the application router with all endpoints and middleware.
#[instrument(skip_all)]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::handlers::health::health))
        .route("/v1/control-plane/health", get(api::handlers::health::control_plane_health))
        // Billing
        .route("/v1/billing/checkout", post(api::handlers::billing::create_checkout))
        .route("/v1/webhooks/stripe", post(api::handlers::billing::stripe_webhook))
        // Orders
        .route("/v1/orders", get(api::handlers::orders::list_orders))
        .route("/v1/orders/{id}", get(api::handlers::orders::get_order))
        .route("/v1/orders/{id}/provision", post(api::handlers::orders::provision_order))
        // Deployments
        .route(
            "/v1/deployments",
            get(api::handlers::deployments::list_deployments).post(api::handlers::deployments::create_deployment),
        )
        .route("/v1/deployments/{id}", get(api::handlers::deployments::get_deployment))
        .route("/v1/deployments/{id}/cancel", post(api::handlers::deployments::cancel_deployment))
        .route("/v1/deployments/{id}/retry", post(api::handlers::deployments::retry_deployment))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .with_state(state)
}

/// The assembled application: HTTP server plus background services.
pub struct Application {
    state: AppState,
    scheduler: Option<Scheduler>,
}

impl Application {
    /// Wire up databases, crypto, auth, and the external clients from
    /// configuration.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let passphrase = config
            .encryption
            .passphrase
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("encryption.passphrase is required"))?;
        let cipher = Cipher::new(passphrase)?;

        let (orders_db, deployments_db) =
            db::setup_databases(&config.databases.orders_path, &config.databases.deployments_path).await?;

        let auth = Arc::new(AuthResolver::new(&config.auth)?);

        let gateway: Option<Arc<dyn PaymentGateway>> = match (&config.billing.stripe_secret_key, &config.billing.stripe_webhook_secret) {
            (Some(secret_key), Some(webhook_secret)) => {
                Some(Arc::new(StripeGateway::new(secret_key.clone(), webhook_secret.clone())))
            }
            _ => {
                warn!("Stripe is not configured; checkout and webhook intake are disabled");
                None
            }
        };

        let hooks = StoreHooks::new();

        let state = AppState {
            orders_db,
            deployments_db: deployments_db.clone(),
            config: config.clone(),
            cipher: cipher.clone(),
            auth,
            gateway,
            hooks: hooks.clone(),
        };

        let scheduler = if config.worker.enabled {
            match &config.provisioner.api_token {
                Some(api_token) => {
                    let provisioner = Arc::new(HetznerClient::new(api_token.clone(), config.provisioner.api_base_url.clone()));
                    let bootstrap = Arc::new(OpenSshRunner::new(
                        config.bootstrap.ssh_private_key_path.clone(),
                        config.bootstrap.script_path.clone(),
                    ));
                    Some(Scheduler::new(deployments_db, config.clone(), cipher, provisioner, bootstrap, hooks))
                }
                None => {
                    warn!("Worker enabled but provisioner.api_token is missing; scheduler will not run");
                    None
                }
            }
        } else {
            info!("Background worker disabled by configuration");
            None
        };

        Ok(Self { state, scheduler })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve HTTP and run background services until `shutdown` resolves.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let token = CancellationToken::new();

        if let Some(scheduler) = self.scheduler.clone() {
            tokio::spawn(scheduler.run_daemon(token.clone()));
        }

        if let Some(mirror_url) = self.state.config.hooks.mirror_url.clone() {
            tokio::spawn(db::hooks::run_mirror(self.state.hooks.clone(), mirror_url, token.clone()));
        }

        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Listening on {addr}");

        let router = build_router(self.state);
        let server_token = token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                server_token.cancel();
            })
            .await?;

        // Make sure background tasks stop even if the shutdown future
        // resolved through a server error path.
        token.cancel();
        info!("Shutdown complete");
        Ok(())
    }
}
