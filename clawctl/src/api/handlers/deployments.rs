//! HTTP handlers for deployments. Every path is owner-scoped.

use crate::AppState;
use crate::api::models::deployments::{
    DeploymentEventResponse, DeploymentInput, DeploymentResponse, validation_details,
};
use crate::auth::CurrentUser;
use crate::db::handlers::Deployments;
use crate::db::models::deployments::{DeploymentCreateDBRequest, DeploymentStatus};
use crate::errors::{Error, Result};
use crate::types::DeploymentId;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// `POST /v1/deployments` - create an owner-scoped deployment directly,
/// bypassing billing.
#[tracing::instrument(skip_all, fields(user = %user.id))]
pub async fn create_deployment(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(input): Json<DeploymentInput>,
) -> Result<Response> {
    let validated = input.validate().map_err(|errors| Error::BadRequest {
        message: "deployment intent failed validation".to_string(),
        details: Some(validation_details(&errors)),
    })?;

    let config_enc = state.cipher.encrypt(&validated.config).map_err(anyhow::Error::from)?;
    let secrets_enc = state.cipher.encrypt(&validated.secrets).map_err(anyhow::Error::from)?;

    let mut conn = state.deployments_db.acquire().await.map_err(anyhow::Error::from)?;
    let mut repo = Deployments::new(&mut conn);
    let deployment = repo
        .create(&DeploymentCreateDBRequest {
            name: validated.config.name.clone(),
            owner_user_id: user.id.clone(),
            config_enc,
            secrets_enc,
            metadata: json!({}),
            billing_ref: None,
        })
        .await?;
    repo.append_event(deployment.id, "queued", "deployment queued", None).await?;

    state.hooks.deployment_changed(deployment.id);
    state.hooks.event_appended(deployment.id, "queued");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "deployment": DeploymentResponse::from(deployment) })),
    )
        .into_response())
}

/// `GET /v1/deployments` - owner-filtered listing.
#[tracing::instrument(skip_all, fields(user = %user.id))]
pub async fn list_deployments(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>> {
    let limit = params.limit.clamp(1, 200);
    let mut conn = state.deployments_db.acquire().await.map_err(anyhow::Error::from)?;
    let deployments = Deployments::new(&mut conn).list_owned(&user.id, params.skip.max(0), limit).await?;

    let deployments: Vec<DeploymentResponse> = deployments.into_iter().map(Into::into).collect();
    Ok(Json(json!({ "ok": true, "deployments": deployments })))
}

/// `GET /v1/deployments/{id}` - the deployment plus its audit events.
#[tracing::instrument(skip_all, fields(user = %user.id))]
pub async fn get_deployment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<DeploymentId>,
) -> Result<Json<Value>> {
    let mut conn = state.deployments_db.acquire().await.map_err(anyhow::Error::from)?;
    let mut repo = Deployments::new(&mut conn);

    let deployment = repo.get_owned(&user.id, id).await?.ok_or_else(|| Error::NotFound {
        resource: "Deployment".to_string(),
        id: id.to_string(),
    })?;
    let events = repo.list_events(id).await?;

    let events: Vec<DeploymentEventResponse> = events.into_iter().map(Into::into).collect();
    Ok(Json(json!({ "ok": true, "deployment": DeploymentResponse::from(deployment), "events": events })))
}

/// `POST /v1/deployments/{id}/cancel`
#[tracing::instrument(skip_all, fields(user = %user.id))]
pub async fn cancel_deployment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<DeploymentId>,
) -> Result<Json<Value>> {
    let mut conn = state.deployments_db.acquire().await.map_err(anyhow::Error::from)?;
    let mut repo = Deployments::new(&mut conn);

    let deployment = repo.request_cancel(&user.id, id).await?.ok_or_else(|| Error::NotFound {
        resource: "Deployment".to_string(),
        id: id.to_string(),
    })?;

    // The cancel request itself is audited regardless of which of the three
    // outcomes it hit; no-ops on terminal rows still record the attempt.
    repo.append_event(id, "cancel.requested", "cancellation requested by owner", None).await?;
    state.hooks.deployment_changed(id);
    state.hooks.event_appended(id, "cancel.requested");

    Ok(Json(json!({ "ok": true, "deployment": DeploymentResponse::from(deployment) })))
}

/// `POST /v1/deployments/{id}/retry` - return a failed or canceled
/// deployment to the queue. 409 when the current state doesn't allow it.
#[tracing::instrument(skip_all, fields(user = %user.id))]
pub async fn retry_deployment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<DeploymentId>,
) -> Result<Json<Value>> {
    let mut conn = state.deployments_db.acquire().await.map_err(anyhow::Error::from)?;
    let mut repo = Deployments::new(&mut conn);

    let deployment = repo.retry(&user.id, id).await?.ok_or_else(|| Error::NotFound {
        resource: "Deployment".to_string(),
        id: id.to_string(),
    })?;

    // The repository returns the current row when the retry predicate
    // didn't match; anything not pending is a conflict.
    if deployment.status != DeploymentStatus::Pending {
        if deployment.has_resources() {
            return Err(Error::conflict("deployment still holds provider resources"));
        }
        return Err(Error::conflict(format!(
            "deployment is {} and cannot be retried",
            deployment.status.to_db_string()
        )));
    }

    repo.append_event(id, "retry.requested", "deployment returned to queue by owner", None).await?;
    state.hooks.deployment_changed(id);
    state.hooks.event_appended(id, "retry.requested");

    Ok(Json(json!({ "ok": true, "deployment": DeploymentResponse::from(deployment) })))
}
