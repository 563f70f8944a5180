//! Error types and HTTP response conversion.
//!
//! The main [`Error`] enum covers all application error cases:
//!
//! - **Validation**: `BadRequest` (400) with optional structured details
//! - **Authentication**: `Unauthenticated` (401), `AuthNotReady` (503)
//! - **Conflict**: `Conflict` (409), including idempotency fingerprint
//!   mismatches and in-progress retries carrying `retryAfterSeconds`
//! - **Not Found**: `NotFound` (404) for owner-scoped lookup misses
//! - **Downstream**: payment gateway / cloud provider failures (502)
//! - **Fatal stored secret**: an entity whose ciphertext no longer decrypts (500)
//! - **Database / Internal**: everything else (500)
//!
//! All errors convert to the JSON envelope `{ok:false, error, details?}`.

use crate::db::errors::DbError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Authentication required but not provided or invalid
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// The auth resolver cannot currently verify credentials (e.g. JWKS unavailable)
    #[error("Authentication backend not ready: {message}")]
    AuthNotReady { message: String },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String, details: Option<Value> },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// State conflict: idempotency mismatch, in-progress request, terminal-state operation
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    /// A payment or cloud provider call failed
    #[error("Downstream error: {message}")]
    Downstream { message: String },

    /// A required external collaborator is not configured
    #[error("{feature} is not configured")]
    NotConfigured { feature: String },

    /// Stored ciphertext on an entity failed to decrypt; the entity has been marked failed
    #[error("stored payload cannot be decrypted")]
    UndecryptablePayload { resource: String, id: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest {
            message: message.into(),
            details: None,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::AuthNotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Downstream { .. } => StatusCode::BAD_GATEWAY,
            Error::NotConfigured { .. } => StatusCode::NOT_IMPLEMENTED,
            Error::UndecryptablePayload { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } | DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::UndecryptablePayload => StatusCode::INTERNAL_SERVER_ERROR,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::AuthNotReady { message } => message.clone(),
            Error::BadRequest { message, .. } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::Conflict { message, .. } => message.clone(),
            Error::Downstream { message } => message.clone(),
            Error::NotConfigured { feature } => format!("{feature} is not configured"),
            Error::UndecryptablePayload { .. } => "stored payload cannot be decrypted".to_string(),
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => "Resource already exists".to_string(),
                DbError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::UndecryptablePayload => "stored payload cannot be decrypted".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details - different log levels based on severity
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::UndecryptablePayload { resource, id } => {
                tracing::error!(%resource, %id, "Stored payload failed to decrypt");
            }
            Error::Downstream { .. } | Error::NotConfigured { .. } => {
                tracing::warn!("Downstream provider error: {}", self);
            }
            Error::Database(_) | Error::Conflict { .. } => {
                tracing::warn!("Conflict or constraint error: {}", self);
            }
            Error::Unauthenticated { .. } | Error::AuthNotReady { .. } => {
                tracing::info!("Authentication error: {}", self);
            }
            Error::BadRequest { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        let mut body = json!({
            "ok": false,
            "error": self.user_message(),
        });

        match &self {
            Error::BadRequest { details: Some(details), .. } => {
                body["details"] = details.clone();
            }
            Error::Conflict {
                retry_after_seconds: Some(secs),
                ..
            } => {
                body["retryAfterSeconds"] = json!(secs);
            }
            Error::UndecryptablePayload { resource, id } => {
                body["details"] = json!({ "resource": resource, "id": id });
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
