//! API models for deployments: the deployment intent schema and response
//! shapes.
//!
//! Input handling is a two-stage pipeline: serde parses a permissive
//! [`DeploymentInput`] (defaults applied, unknown spellings rejected), then
//! [`DeploymentInput::validate`] enforces cross-field constraints and splits
//! the intent into the non-secret [`DeploymentConfig`] and the
//! [`DeploymentSecrets`] that only ever exist encrypted at rest.

use crate::db::models::deployments::{Deployment, DeploymentEvent};
use crate::naming::normalize_label;
use crate::types::{DeploymentId, OrderId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which model provider the deployed agent authenticates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthChoice {
    Anthropic,
    Openai,
}

/// Who may talk to the deployed agent on Discord.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscordGroupPolicy {
    #[default]
    Open,
    Allowlist,
}

/// Permissive parse stage of the deployment intent. Cross-field rules live
/// in [`Self::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentInput {
    pub name: String,
    pub auth_choice: AuthChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_bot_token: Option<String>,
    #[serde(default)]
    pub discord_group_policy: DiscordGroupPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_guild_id: Option<String>,
    #[serde(default)]
    pub discord_channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tailscale_auth_key: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// One structured validation failure.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Non-secret deployment configuration, encrypted at rest as one envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    pub name: String,
    pub auth_choice: AuthChoice,
    pub discord_group_policy: DiscordGroupPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_guild_id: Option<String>,
    #[serde(default)]
    pub discord_channels: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Secrets for a deployment. Plaintext instances exist only inside a
/// checkout/bridge call or a provision protocol invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSecrets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_bot_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tailscale_auth_key: Option<String>,
}

impl DeploymentSecrets {
    /// The API key matching the configured auth choice, if present.
    pub fn api_key_for(&self, choice: AuthChoice) -> Option<&str> {
        match choice {
            AuthChoice::Anthropic => self.anthropic_api_key.as_deref(),
            AuthChoice::Openai => self.openai_api_key.as_deref(),
        }
    }
}

/// A validated intent, split into its at-rest halves.
#[derive(Debug, Clone)]
pub struct ValidatedDeployment {
    pub config: DeploymentConfig,
    pub secrets: DeploymentSecrets,
}

impl DeploymentInput {
    /// Validate stage: normalize the name and enforce cross-field rules.
    pub fn validate(&self) -> Result<ValidatedDeployment, Vec<FieldError>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(FieldError {
                field: "name".to_string(),
                message: "name must not be empty".to_string(),
            });
        }
        let name = normalize_label(&self.name);

        // The chosen auth provider requires its matching key
        match self.auth_choice {
            AuthChoice::Anthropic if self.anthropic_api_key.as_deref().map_or(true, str::is_empty) => {
                errors.push(FieldError {
                    field: "anthropicApiKey".to_string(),
                    message: "authChoice \"anthropic\" requires anthropicApiKey".to_string(),
                });
            }
            AuthChoice::Openai if self.openai_api_key.as_deref().map_or(true, str::is_empty) => {
                errors.push(FieldError {
                    field: "openaiApiKey".to_string(),
                    message: "authChoice \"openai\" requires openaiApiKey".to_string(),
                });
            }
            _ => {}
        }

        // Allowlist policy requires a guild and a non-empty channel set
        if self.discord_group_policy == DiscordGroupPolicy::Allowlist {
            if self.discord_guild_id.as_deref().map_or(true, str::is_empty) {
                errors.push(FieldError {
                    field: "discordGuildId".to_string(),
                    message: "discordGroupPolicy \"allowlist\" requires discordGuildId".to_string(),
                });
            }
            if self.discord_channels.is_empty() {
                errors.push(FieldError {
                    field: "discordChannels".to_string(),
                    message: "discordGroupPolicy \"allowlist\" requires at least one channel".to_string(),
                });
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(ValidatedDeployment {
            config: DeploymentConfig {
                name,
                auth_choice: self.auth_choice,
                discord_group_policy: self.discord_group_policy,
                discord_guild_id: self.discord_guild_id.clone(),
                discord_channels: self.discord_channels.clone(),
                metadata: self.metadata.clone(),
            },
            secrets: DeploymentSecrets {
                anthropic_api_key: self.anthropic_api_key.clone(),
                openai_api_key: self.openai_api_key.clone(),
                discord_bot_token: self.discord_bot_token.clone(),
                tailscale_auth_key: self.tailscale_auth_key.clone(),
            },
        })
    }
}

/// Convert field errors into the `details` payload of a 400.
pub fn validation_details(errors: &[FieldError]) -> Value {
    serde_json::json!({ "fields": errors })
}

/// Public response shape for a deployment. Ciphertext columns never leave
/// the store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResponse {
    pub id: DeploymentId,
    pub provider: String,
    pub name: String,
    pub owner_user_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_ref: Option<OrderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tailnet_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl From<Deployment> for DeploymentResponse {
    fn from(d: Deployment) -> Self {
        Self {
            id: d.id,
            provider: d.provider,
            name: d.name,
            owner_user_id: d.owner_user_id,
            status: d.status.to_db_string().to_string(),
            active_task: d.active_task.map(|t| t.to_db_string().to_string()),
            billing_ref: d.billing_ref,
            server_id: d.server_id,
            server_name: d.server_name,
            public_ip: d.public_ip,
            tailnet_url: d.tailnet_url,
            cancel_requested_at: d.cancel_requested_at,
            error_message: d.error_message,
            created_at: d.created_at,
            updated_at: d.updated_at,
            started_at: d.started_at,
            completed_at: d.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentEventResponse {
    pub id: i64,
    pub event_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub created_at: i64,
}

impl From<DeploymentEvent> for DeploymentEventResponse {
    fn from(e: DeploymentEvent) -> Self {
        Self {
            id: e.id,
            event_type: e.event_type,
            message: e.message,
            payload: e.payload.and_then(|p| serde_json::from_str(&p).ok()),
            created_at: e.created_at,
        }
    }
}
