//! Liveness and configuration-readiness endpoints.

use crate::AppState;
use crate::auth::CurrentUser;
use axum::{Json, extract::State};
use serde_json::{Value, json};

/// `GET /health` - unauthenticated liveness.
pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "status": "ok" }))
}

/// `GET /v1/control-plane/health` - authenticated readiness. Reports which
/// subsystems are usable with the current configuration.
pub async fn control_plane_health(State(state): State<AppState>, _user: CurrentUser) -> Json<Value> {
    let mut issues: Vec<String> = Vec::new();

    if state.gateway.is_none() {
        issues.push("payment provider is not configured; checkout and webhooks are disabled".to_string());
    }
    if state.config.billing.plans.is_empty() {
        issues.push("no billing plans configured".to_string());
    }
    if state.config.provisioner.api_token.is_none() {
        issues.push("provisioner API token is not configured; provisioning will fail".to_string());
    }
    if !state.config.worker.enabled {
        issues.push("background worker is disabled; queued deployments will not run".to_string());
    }
    if !state.config.bootstrap.ssh_public_key_path.exists() {
        issues.push("bootstrap SSH public key file is missing".to_string());
    }
    if let Err(message) = state.auth.check_ready().await {
        issues.push(message);
    }

    Json(json!({
        "ok": issues.is_empty(),
        "issues": issues,
        "workerEnabled": state.config.worker.enabled,
    }))
}
