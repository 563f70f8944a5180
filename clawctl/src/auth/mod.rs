//! Authentication: mapping inbound credentials to tenant identities.
//!
//! Three resolver modes, selected by configuration:
//!
//! - **disabled**: every request resolves to the configured default tenant
//! - **token**: constant-time comparison of the SHA-256 of the presented
//!   bearer token against each configured token hash
//! - **jwt**: JWKS-verified JWT with issuer, audience, algorithm allowlist
//!   and optional max-age enforcement; the tenant id comes from a
//!   configurable subject claim
//!
//! Deployment mutation paths require a resolved tenant; the webhook endpoint
//! never authenticates and therefore never owns a deployment directly.

pub mod current_user;

pub use current_user::CurrentUser;

use crate::config::{AuthConfig, AuthMode, JwtConfig};
use crate::errors::Error;
use crate::types::UserId;
use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header, jwk::JwkSet};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

/// Resolves inbound credentials to a stable tenant identifier.
pub struct AuthResolver {
    mode: AuthMode,
    default_user_id: UserId,
    tokens: Vec<(Vec<u8>, UserId)>,
    jwt: Option<JwtState>,
    http: reqwest::Client,
}

struct JwtState {
    config: JwtConfig,
    algorithms: Vec<Algorithm>,
    keys: RwLock<Option<JwkSet>>,
}

impl AuthResolver {
    pub fn new(config: &AuthConfig) -> anyhow::Result<Self> {
        let tokens = config
            .tokens
            .iter()
            .map(|entry| {
                let digest = hex::decode(&entry.token_sha256)
                    .map_err(|_| anyhow::anyhow!("auth token hash for {} is not hex", entry.user_id))?;
                if digest.len() != 32 {
                    anyhow::bail!("auth token hash for {} is not SHA-256 sized", entry.user_id);
                }
                Ok((digest, entry.user_id.clone()))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let jwt = match (&config.mode, &config.jwt) {
            (AuthMode::Jwt, Some(jwt_config)) => {
                let algorithms = jwt_config
                    .algorithms
                    .iter()
                    .map(|name| Algorithm::from_str(name).map_err(|_| anyhow::anyhow!("unknown JWT algorithm {name:?}")))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Some(JwtState {
                    config: jwt_config.clone(),
                    algorithms,
                    keys: RwLock::new(None),
                })
            }
            _ => None,
        };

        Ok(Self {
            mode: config.mode,
            default_user_id: config.default_user_id.clone(),
            tokens,
            jwt,
            http: reqwest::Client::new(),
        })
    }

    /// The tenant that owns webhook-driven provisioning.
    pub fn default_user_id(&self) -> &UserId {
        &self.default_user_id
    }

    /// Resolve the request's credentials, or report unauthenticated.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<UserId, Error> {
        match self.mode {
            AuthMode::Disabled => Ok(self.default_user_id.clone()),
            AuthMode::Token => self.resolve_token(headers),
            AuthMode::Jwt => self.resolve_jwt(headers).await,
        }
    }

    /// Whether the resolver can currently verify credentials. Used by the
    /// control-plane health endpoint; a JWKS that can't be fetched means 503s
    /// on authenticated routes.
    pub async fn check_ready(&self) -> Result<(), String> {
        match self.mode {
            AuthMode::Disabled | AuthMode::Token => Ok(()),
            AuthMode::Jwt => match self.fetch_keys().await {
                Ok(_) => Ok(()),
                Err(e) => Err(format!("JWKS unavailable: {e}")),
            },
        }
    }

    fn bearer_token<'h>(headers: &'h HeaderMap) -> Result<&'h str, Error> {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .filter(|token| !token.is_empty())
            .ok_or(Error::Unauthenticated {
                message: Some("missing bearer token".to_string()),
            })
    }

    fn resolve_token(&self, headers: &HeaderMap) -> Result<UserId, Error> {
        let token = Self::bearer_token(headers)?;
        let presented = Sha256::digest(token.as_bytes());

        // Check every configured hash so timing doesn't reveal which (if
        // any) entry matched.
        let mut matched: Option<&UserId> = None;
        for (digest, user_id) in &self.tokens {
            if bool::from(presented.as_slice().ct_eq(digest.as_slice())) {
                matched = Some(user_id);
            }
        }

        matched.cloned().ok_or(Error::Unauthenticated {
            message: Some("unrecognized token".to_string()),
        })
    }

    async fn fetch_keys(&self) -> anyhow::Result<JwkSet> {
        let jwt = self.jwt.as_ref().ok_or_else(|| anyhow::anyhow!("JWT mode not configured"))?;

        if let Some(keys) = jwt.keys.read().await.clone() {
            return Ok(keys);
        }

        let keys: JwkSet = self
            .http
            .get(jwt.config.jwks_url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        *jwt.keys.write().await = Some(keys.clone());
        tracing::info!(url = %jwt.config.jwks_url, keys = keys.keys.len(), "Fetched JWKS");
        Ok(keys)
    }

    async fn resolve_jwt(&self, headers: &HeaderMap) -> Result<UserId, Error> {
        let jwt = self.jwt.as_ref().ok_or_else(|| Error::AuthNotReady {
            message: "JWT resolver not configured".to_string(),
        })?;
        let token = Self::bearer_token(headers)?;

        let header = decode_header(token).map_err(|e| Error::Unauthenticated {
            message: Some(format!("malformed token: {e}")),
        })?;

        if !jwt.algorithms.contains(&header.alg) {
            return Err(Error::Unauthenticated {
                message: Some("token algorithm not allowed".to_string()),
            });
        }

        let keys = self.fetch_keys().await.map_err(|e| Error::AuthNotReady {
            message: format!("JWKS unavailable: {e}"),
        })?;

        let jwk = header
            .kid
            .as_deref()
            .and_then(|kid| keys.find(kid))
            .or_else(|| keys.keys.first())
            .ok_or(Error::Unauthenticated {
                message: Some("no matching signing key".to_string()),
            })?;

        let decoding_key = DecodingKey::from_jwk(jwk).map_err(|e| Error::AuthNotReady {
            message: format!("unusable signing key: {e}"),
        })?;

        let mut validation = Validation::new(header.alg);
        validation.algorithms = jwt.algorithms.clone();
        validation.set_issuer(&[&jwt.config.issuer]);
        validation.set_audience(&[&jwt.config.audience]);

        let data = decode::<serde_json::Value>(token, &decoding_key, &validation).map_err(|e| Error::Unauthenticated {
            message: Some(format!("token rejected: {e}")),
        })?;

        if let Some(max_age) = jwt.config.max_age {
            let iat = data.claims.get("iat").and_then(|v| v.as_i64()).ok_or(Error::Unauthenticated {
                message: Some("token missing iat".to_string()),
            })?;
            let age = chrono::Utc::now().timestamp() - iat;
            if age > max_age.as_secs() as i64 {
                return Err(Error::Unauthenticated {
                    message: Some("token too old".to_string()),
                });
            }
        }

        data.claims
            .get(&jwt.config.subject_claim)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .ok_or(Error::Unauthenticated {
                message: Some(format!("token missing {} claim", jwt.config.subject_claim)),
            })
    }
}

/// Hex SHA-256 of a token, the form stored in configuration.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
