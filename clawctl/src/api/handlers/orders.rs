//! HTTP handlers for orders.
//!
//! Orders are keyed by the payment provider's references rather than the
//! tenant, so listing and fetching require authentication but are not
//! owner-filtered; the deployments they spawn are.

use crate::AppState;
use crate::api::models::orders::{OrderEventResponse, OrderResponse};
use crate::auth::CurrentUser;
use crate::billing::bridge;
use crate::db::handlers::Orders;
use crate::errors::{Error, Result};
use crate::types::OrderId;
use axum::{
    Json,
    extract::{Path, Query, State},
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

/// `GET /v1/orders`
#[tracing::instrument(skip_all)]
pub async fn list_orders(State(state): State<AppState>, _user: CurrentUser, Query(params): Query<ListParams>) -> Result<Json<Value>> {
    let limit = params.limit.clamp(1, 200);
    let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
    let orders = Orders::new(&mut conn).list(params.skip.max(0), limit).await?;

    let orders: Vec<OrderResponse> = orders.into_iter().map(Into::into).collect();
    Ok(Json(json!({ "ok": true, "orders": orders })))
}

/// `GET /v1/orders/{id}` - the order plus its audit events.
#[tracing::instrument(skip_all)]
pub async fn get_order(State(state): State<AppState>, _user: CurrentUser, Path(id): Path<OrderId>) -> Result<Json<Value>> {
    let mut conn = state.orders_db.acquire().await.map_err(anyhow::Error::from)?;
    let mut orders = Orders::new(&mut conn);

    let order = orders.get_by_id(id).await?.ok_or_else(|| Error::NotFound {
        resource: "Order".to_string(),
        id: id.to_string(),
    })?;
    let events = orders.list_events(id).await?;

    let events: Vec<OrderEventResponse> = events.into_iter().map(Into::into).collect();
    Ok(Json(json!({ "ok": true, "order": OrderResponse::from(order), "events": events })))
}

/// `POST /v1/orders/{id}/provision` - manual bridge for a paid order. The
/// resulting deployment belongs to the caller.
#[tracing::instrument(skip_all)]
pub async fn provision_order(State(state): State<AppState>, user: CurrentUser, Path(id): Path<OrderId>) -> Result<Json<Value>> {
    let result = bridge::provision_order(&state, id, &user.id).await?;
    Ok(Json(json!({
        "ok": true,
        "created": result.created,
        "deploymentId": result.deployment.id,
    })))
}
