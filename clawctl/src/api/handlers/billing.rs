//! HTTP handlers for checkout and webhook intake.

use crate::AppState;
use crate::api::models::orders::{CheckoutRequest, valid_idempotency_key};
use crate::auth::CurrentUser;
use crate::billing::{checkout, webhook};
use crate::errors::{Error, Result};
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};

/// `POST /v1/billing/checkout`
#[tracing::instrument(skip_all)]
pub async fn create_checkout(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> Result<Response> {
    let idempotency_key = match headers.get("idempotency-key") {
        None => None,
        Some(value) => {
            let key = value
                .to_str()
                .map_err(|_| Error::bad_request("Idempotency-Key is not valid ASCII"))?;
            if !valid_idempotency_key(key) {
                return Err(Error::bad_request(
                    "Idempotency-Key must be 1-200 characters from [A-Za-z0-9._:-]",
                ));
            }
            Some(key.to_string())
        }
    };

    let (status, body) = checkout::create_checkout(&state, &user, idempotency_key, request).await?;
    Ok((status, Json(body)).into_response())
}

/// `POST /v1/webhooks/stripe`
///
/// Takes the raw body bytes: the signature covers the exact byte sequence,
/// so nothing may parse or normalize it first.
#[tracing::instrument(skip_all)]
pub async fn stripe_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response> {
    let (status, response) = webhook::handle_webhook(&state, &headers, &body).await?;
    Ok((status, Json(response)).into_response())
}
