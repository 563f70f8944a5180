//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` but can be specified
//! via `-f` flag or the `CLAWCTL_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Sources are merged in order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `CLAWCTL_` override
//!    YAML values; nested fields use double underscores, e.g.
//!    `CLAWCTL_WORKER__LEASE_MS=120000`.
//!
//! ## Key sections
//!
//! - **Server**: `host`, `port`
//! - **Databases**: `databases.orders_path`, `databases.deployments_path`
//! - **Encryption**: `encryption.passphrase` (>= 16 bytes, required)
//! - **Auth**: `auth.mode` (`disabled`/`token`/`jwt`) and its parameters,
//!   plus `auth.default_user_id` - the tenant used when auth is disabled and
//!   the owner for webhook-driven provisioning
//! - **Billing**: `billing.plans`, `billing.stripe_secret_key`,
//!   `billing.stripe_webhook_secret`, `billing.success_url`,
//!   `billing.cancel_url`, `billing.auto_provision_on_paid`
//! - **Worker**: `worker.enabled`, `worker.tick_interval`, `worker.lease_ms`
//! - **Provisioner**: `provisioner.api_token`, server shape defaults
//! - **Bootstrap**: `bootstrap.ssh_public_key_path`, `bootstrap.ssh_private_key_path`

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Simple CLI args - just for specifying the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "CLAWCTL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// SQLite database locations
    pub databases: DatabasesConfig,
    /// Envelope encryption settings
    pub encryption: EncryptionConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Billing plans and payment provider settings
    pub billing: BillingConfig,
    /// Background worker settings
    pub worker: WorkerConfig,
    /// Cloud provider settings
    pub provisioner: ProvisionerConfig,
    /// Host bootstrap settings
    pub bootstrap: BootstrapConfig,
    /// Change notification fan-out
    pub hooks: HooksConfig,
}

/// Best-effort change notification fan-out.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HooksConfig {
    /// Optional external mirror receiving deployment change notifications
    pub mirror_url: Option<url::Url>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            databases: DatabasesConfig::default(),
            encryption: EncryptionConfig::default(),
            auth: AuthConfig::default(),
            billing: BillingConfig::default(),
            worker: WorkerConfig::default(),
            provisioner: ProvisionerConfig::default(),
            bootstrap: BootstrapConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabasesConfig {
    /// Path to the orders database file (orders, order events, webhook dedup,
    /// checkout idempotency)
    pub orders_path: PathBuf,
    /// Path to the deployments database file (deployments, deployment events)
    pub deployments_path: PathBuf,
}

impl Default for DatabasesConfig {
    fn default() -> Self {
        Self {
            orders_path: PathBuf::from(".clawctl_data/orders.db"),
            deployments_path: PathBuf::from(".clawctl_data/deployments.db"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncryptionConfig {
    /// Passphrase for the envelope cipher. Must be at least 16 bytes.
    pub passphrase: Option<String>,
}

/// Authentication configuration for the three resolver modes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Resolver mode
    pub mode: AuthMode,
    /// Tenant id used when auth is disabled, and the deployment owner for
    /// webhook-driven provisioning.
    pub default_user_id: String,
    /// Token mode: configured bearer tokens
    pub tokens: Vec<TokenEntry>,
    /// JWT mode parameters
    pub jwt: Option<JwtConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Disabled,
            default_user_id: "default".to_string(),
            tokens: Vec::new(),
            jwt: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Disabled,
    Token,
    Jwt,
}

/// A bearer token binding: the hex SHA-256 of the token and the tenant it
/// resolves to. Raw tokens are never stored in configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TokenEntry {
    pub token_sha256: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JwtConfig {
    /// JWKS document URL
    pub jwks_url: url::Url,
    /// Required `iss` claim
    pub issuer: String,
    /// Required `aud` claim
    pub audience: String,
    /// Accepted signing algorithms (e.g. ["RS256", "ES256"])
    #[serde(default = "default_jwt_algorithms")]
    pub algorithms: Vec<String>,
    /// Claim carrying the tenant id (default "sub")
    #[serde(default = "default_subject_claim")]
    pub subject_claim: String,
    /// Maximum accepted token age from `iat`, if set
    #[serde(default, with = "humantime_serde::option")]
    pub max_age: Option<Duration>,
}

fn default_jwt_algorithms() -> Vec<String> {
    vec!["RS256".to_string()]
}

fn default_subject_claim() -> String {
    "sub".to_string()
}

/// Billing plans and payment provider settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BillingConfig {
    /// Plan catalog
    pub plans: Vec<BillingPlan>,
    /// Stripe secret API key
    pub stripe_secret_key: Option<String>,
    /// Stripe webhook signing secret
    pub stripe_webhook_secret: Option<String>,
    /// Default redirect URL after a successful checkout
    pub success_url: String,
    /// Default redirect URL after a cancelled checkout
    pub cancel_url: String,
    /// Whether a paid order automatically queues a deployment from the
    /// webhook path
    pub auto_provision_on_paid: bool,
    /// How long a checkout idempotency in-progress marker is honored before
    /// another request may take over (clamped to at least 30s)
    pub idempotency_stale_ms: i64,
    /// How long a webhook dedup entry may sit in `processing` before it is
    /// considered abandoned
    pub webhook_processing_timeout_ms: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            plans: Vec::new(),
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            success_url: "http://localhost:3000/checkout/success".to_string(),
            cancel_url: "http://localhost:3000/checkout/cancelled".to_string(),
            auto_provision_on_paid: true,
            idempotency_stale_ms: 120_000,
            webhook_processing_timeout_ms: 120_000,
        }
    }
}

/// A purchasable plan. Amounts are integer minor units; currency is a
/// lowercase ISO-4217 code.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BillingPlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub amount: i64,
    pub currency: String,
    /// Cloud server shape for this plan (defaults to the provisioner's)
    #[serde(default)]
    pub server_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Whether the background scheduler runs in this process
    pub enabled: bool,
    /// Interval between scheduler ticks
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Lease duration in milliseconds for provisioning/destroy jobs
    pub lease_ms: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(5),
            lease_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionerConfig {
    /// Hetzner Cloud API token
    pub api_token: Option<String>,
    /// API base URL (overridable for tests)
    pub api_base_url: String,
    /// Default server shape when the plan doesn't carry one
    pub server_type: String,
    /// OS image for created servers
    pub image: String,
    /// Datacenter location
    pub location: String,
    /// How long to wait on an asynchronous provider action
    #[serde(with = "humantime_serde")]
    pub action_timeout: Duration,
    /// How long to wait for a public IPv4 after server creation
    #[serde(with = "humantime_serde")]
    pub ip_timeout: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            api_base_url: "https://api.hetzner.cloud/v1".to_string(),
            server_type: "cx23".to_string(),
            image: "ubuntu-24.04".to_string(),
            location: "fsn1".to_string(),
            action_timeout: Duration::from_secs(180),
            ip_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootstrapConfig {
    /// Path to the SSH public key registered with the cloud provider
    pub ssh_public_key_path: PathBuf,
    /// Path to the matching private key used to reach new hosts
    pub ssh_private_key_path: PathBuf,
    /// Path to the bootstrap script transferred to new hosts
    pub script_path: PathBuf,
    /// How long to wait for SSH to accept connections on a new host
    #[serde(with = "humantime_serde")]
    pub ssh_ready_timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            ssh_public_key_path: PathBuf::from(".clawctl_data/id_ed25519.pub"),
            ssh_private_key_path: PathBuf::from(".clawctl_data/id_ed25519"),
            script_path: PathBuf::from(".clawctl_data/bootstrap.sh"),
            ssh_ready_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Load configuration from the YAML file and `CLAWCTL_` environment
    /// overrides, then validate it.
    pub fn load(args: &Args) -> anyhow::Result<Config> {
        let config: Config = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("CLAWCTL_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde can't express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(passphrase) = &self.encryption.passphrase {
            if passphrase.len() < 16 {
                anyhow::bail!("encryption.passphrase must be at least 16 bytes");
            }
        }

        for plan in &self.billing.plans {
            if plan.amount <= 0 {
                anyhow::bail!("billing plan {} has non-positive amount {}", plan.id, plan.amount);
            }
            if plan.currency.len() != 3 || !plan.currency.chars().all(|c| c.is_ascii_lowercase()) {
                anyhow::bail!(
                    "billing plan {} has invalid currency {:?} (expected lowercase ISO-4217)",
                    plan.id,
                    plan.currency
                );
            }
        }

        match self.auth.mode {
            AuthMode::Token if self.auth.tokens.is_empty() => {
                anyhow::bail!("auth.mode is 'token' but no tokens are configured");
            }
            AuthMode::Jwt if self.auth.jwt.is_none() => {
                anyhow::bail!("auth.mode is 'jwt' but auth.jwt is not configured");
            }
            _ => {}
        }

        if self.worker.lease_ms < 1_000 {
            anyhow::bail!("worker.lease_ms must be at least 1000");
        }

        Ok(())
    }

    /// Look up a plan by id.
    pub fn plan(&self, id: &str) -> Option<&BillingPlan> {
        self.billing.plans.iter().find(|p| p.id == id)
    }

    /// Idempotency stale window, clamped to the 30s floor.
    pub fn idempotency_stale_ms(&self) -> i64 {
        self.billing.idempotency_stale_ms.max(30_000)
    }
}
