//! Axum extractor for the authenticated tenant.

use crate::AppState;
use crate::errors::Error;
use crate::types::UserId;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

/// The tenant identity resolved for this request. Handlers that take this
/// extractor fail with 401/503 before their body runs.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: UserId,
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let id = state.auth.resolve(&parts.headers).await?;
        Ok(CurrentUser { id })
    }
}
