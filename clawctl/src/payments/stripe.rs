//! Stripe payment gateway implementation.
//!
//! Checkout sessions are created with a form-encoded POST against the Stripe
//! REST API. Webhook verification implements Stripe's signature scheme by
//! hand because it must run over the raw request body: the
//! `Stripe-Signature` header carries `t=<unix>,v1=<hex hmac>` where the HMAC
//! is SHA-256 over `"{t}.{body}"` with the webhook secret.

use super::{CheckoutSession, CheckoutSessionRequest, PaymentError, PaymentGateway, Result, WebhookEvent, parse_event};
use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Maximum accepted clock skew between the signature timestamp and now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub struct StripeGateway {
    secret_key: String,
    webhook_secret: String,
    api_base: String,
    client: reqwest::Client,
}

impl StripeGateway {
    pub fn new(secret_key: String, webhook_secret: String) -> Self {
        Self {
            secret_key,
            webhook_secret,
            api_base: STRIPE_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn expected_signature(&self, timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(&self, request: &CheckoutSessionRequest) -> Result<CheckoutSession> {
        // Stripe requires form-encoded params, not JSON. The single line item
        // is built ad hoc from the plan so no dashboard price object is needed.
        let amount = request.amount.to_string();
        let mut params: Vec<(String, String)> = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
            ("client_reference_id".to_string(), request.client_reference_id.clone()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("line_items[0][price_data][currency]".to_string(), request.currency.clone()),
            ("line_items[0][price_data][unit_amount]".to_string(), amount),
            (
                "line_items[0][price_data][product_data][name]".to_string(),
                request.plan_name.clone(),
            ),
            (
                "line_items[0][price_data][product_data][description]".to_string(),
                request.plan_description.clone(),
            ),
            ("metadata[order_id]".to_string(), request.order_id.clone()),
        ];

        if let Some(email) = &request.customer_email {
            params.push(("customer_email".to_string(), email.clone()));
        }
        for (key, value) in &request.metadata {
            params.push((format!("metadata[{key}]"), value.clone()));
        }

        let response = self
            .client
            .post(format!("{}/checkout/sessions", self.api_base))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Stripe API request failed: {e}");
                PaymentError::ProviderApi(format!("checkout session request failed: {e}"))
            })?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(|e| {
            tracing::error!("Failed to read Stripe response body: {e}");
            PaymentError::ProviderApi(format!("unreadable provider response: {e}"))
        })?;

        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown provider error");
            tracing::error!(%status, message, "Stripe rejected checkout session");
            return Err(PaymentError::ProviderApi(format!("checkout session rejected ({status}): {message}")));
        }

        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PaymentError::ProviderApi("checkout session missing id".to_string()))?
            .to_string();
        let url = body
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PaymentError::ProviderApi("checkout session missing URL".to_string()))?
            .to_string();

        tracing::info!(session_id = %id, order_id = %request.order_id, "Created checkout session");
        Ok(CheckoutSession { id, url })
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent> {
        let header = headers
            .get("stripe-signature")
            .ok_or_else(|| PaymentError::InvalidData("missing stripe-signature header".to_string()))?
            .to_str()
            .map_err(|_| PaymentError::InvalidData("invalid stripe-signature header".to_string()))?;

        // Header format: t=timestamp,v1=signature[,v1=...]
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| PaymentError::InvalidData("signature header missing timestamp".to_string()))?;
        if signatures.is_empty() {
            return Err(PaymentError::InvalidData("signature header missing v1 signature".to_string()));
        }

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| PaymentError::InvalidData("invalid signature timestamp".to_string()))?;
        let now = chrono::Utc::now().timestamp();
        if (now - ts).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(PaymentError::InvalidData("signature timestamp outside tolerance".to_string()));
        }

        let expected = self.expected_signature(timestamp, body);
        let valid = signatures
            .iter()
            .any(|sig| expected.as_bytes().ct_eq(sig.as_bytes()).into());
        if !valid {
            return Err(PaymentError::InvalidData("webhook signature mismatch".to_string()));
        }

        parse_event(body)
    }
}

/// Build a `Stripe-Signature` header value for a payload. Used by tests and
/// local tooling to fabricate deliveries.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}
