//! Payment gateway abstraction.
//!
//! The concrete provider (Stripe) is an external collaborator; the rest of
//! the system talks to this narrow seam: create a hosted checkout session,
//! verify a signed webhook payload. Tests substitute a mock.

pub mod stripe;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaymentError {
    /// Signature, header or payload shape problems. Maps to 400.
    #[error("Invalid webhook data: {0}")]
    InvalidData(String),

    /// The provider API returned an error
    #[error("Payment provider API error: {0}")]
    ProviderApi(String),
}

pub type Result<T> = std::result::Result<T, PaymentError>;

/// Everything the provider needs to issue a hosted checkout session.
#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub order_id: String,
    pub client_reference_id: String,
    pub plan_name: String,
    pub plan_description: String,
    pub amount: i64,
    pub currency: String,
    pub customer_email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

/// The session the provider issued.
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// A verified webhook event, parsed permissively: typed fields where the
/// dispatch logic needs them, the raw object for everything else.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub session: Option<CheckoutSessionObject>,
    pub raw_object: Value,
}

/// The checkout session object carried by the events we dispatch on.
/// Unknown fields pass through untouched in `raw_object`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
}

impl CheckoutSessionObject {
    /// Buyer email, preferring `customer_details` which Stripe fills more
    /// reliably than the top-level field.
    pub fn buyer_email(&self) -> Option<String> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.clone())
            .or_else(|| self.customer_email.clone())
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }
}

/// Payment provider seam.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a hosted checkout session for an order.
    async fn create_checkout_session(&self, request: &CheckoutSessionRequest) -> Result<CheckoutSession>;

    /// Verify the webhook signature over the raw body and parse the event.
    /// Must be called on the exact byte sequence received, before any JSON
    /// handling.
    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<WebhookEvent>;
}

/// Parse a verified raw payload into a [`WebhookEvent`].
pub(crate) fn parse_event(body: &[u8]) -> Result<WebhookEvent> {
    #[derive(Deserialize)]
    struct RawEvent {
        id: String,
        #[serde(rename = "type")]
        event_type: String,
        data: RawEventData,
    }

    #[derive(Deserialize)]
    struct RawEventData {
        object: Value,
    }

    let event: RawEvent = serde_json::from_slice(body).map_err(|e| PaymentError::InvalidData(format!("malformed event: {e}")))?;

    let session = if event.event_type.starts_with("checkout.session.") {
        serde_json::from_value(event.data.object.clone()).ok()
    } else {
        None
    };

    Ok(WebhookEvent {
        id: event.id,
        event_type: event.event_type,
        session,
        raw_object: event.data.object,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_checkout_event() {
        let body = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_1",
                "payment_status": "paid",
                "payment_intent": "pi_1",
                "customer": "cus_1",
                "customer_details": {"email": "buyer@example.com"},
                "some_future_field": {"nested": true}
            }}
        });

        let event = parse_event(body.to_string().as_bytes()).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "checkout.session.completed");

        let session = event.session.unwrap();
        assert_eq!(session.id, "cs_1");
        assert!(session.is_paid());
        assert_eq!(session.buyer_email().as_deref(), Some("buyer@example.com"));
        // Unknown fields survive in the raw object
        assert!(event.raw_object.get("some_future_field").is_some());
    }

    #[test]
    fn test_parse_non_checkout_event() {
        let body = json!({"id": "evt_2", "type": "invoice.created", "data": {"object": {"id": "in_1"}}});
        let event = parse_event(body.to_string().as_bytes()).unwrap();
        assert!(event.session.is_none());
    }

    #[test]
    fn test_buyer_email_fallback() {
        let session = CheckoutSessionObject {
            id: "cs_1".to_string(),
            customer_email: Some("fallback@example.com".to_string()),
            ..Default::default()
        };
        assert_eq!(session.buyer_email().as_deref(), Some("fallback@example.com"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_event(b"not json").is_err());
        assert!(parse_event(br#"{"id": "evt"}"#).is_err());
    }
}
