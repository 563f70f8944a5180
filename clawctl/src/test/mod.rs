//! End-to-end scenarios over the HTTP surface.
//!
//! These use the real router, real databases on disk, the real webhook
//! signature check, and a mock payment gateway for session creation.

use crate::auth::AuthResolver;
use crate::config::{AuthMode, BillingPlan, Config, TokenEntry};
use crate::crypto::Cipher;
use crate::db::hooks::StoreHooks;
use crate::payments::stripe::{StripeGateway, sign_payload};
use crate::payments::{CheckoutSession, CheckoutSessionRequest, PaymentGateway, WebhookEvent};
use crate::{AppState, build_router, db};
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum_test::TestServer;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tempfile::TempDir;

const WEBHOOK_SECRET: &str = "whsec_e2e_secret";

/// Mock gateway: fabricated checkout sessions, real signature verification.
struct MockGateway {
    verifier: StripeGateway,
    next_session: AtomicU32,
    fail_sessions: AtomicBool,
}

impl MockGateway {
    fn new() -> Self {
        Self {
            verifier: StripeGateway::new("sk_test_fake".to_string(), WEBHOOK_SECRET.to_string()),
            next_session: AtomicU32::new(0),
            fail_sessions: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_checkout_session(&self, _request: &CheckoutSessionRequest) -> crate::payments::Result<CheckoutSession> {
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(crate::payments::PaymentError::ProviderApi("session creation refused".to_string()));
        }
        let n = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CheckoutSession {
            id: format!("cs_e2e_{n}"),
            url: format!("https://pay.example/cs_e2e_{n}"),
        })
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> crate::payments::Result<WebhookEvent> {
        self.verifier.verify_webhook(headers, body)
    }
}

struct TestApp {
    server: TestServer,
    state: AppState,
    gateway: Arc<MockGateway>,
    _dir: TempDir,
}

async fn test_app(configure: impl FnOnce(&mut Config)) -> TestApp {
    let dir = TempDir::new().unwrap();

    let mut config = Config::default();
    config.databases.orders_path = dir.path().join("orders.db");
    config.databases.deployments_path = dir.path().join("deployments.db");
    config.encryption.passphrase = Some("end to end test passphrase".to_string());
    config.billing.plans = vec![BillingPlan {
        id: "hetzner-cx23-launch".to_string(),
        name: "Launch".to_string(),
        description: "Single-tenant agent host".to_string(),
        amount: 2900,
        currency: "eur".to_string(),
        server_type: None,
    }];
    config.billing.stripe_secret_key = Some("sk_test_fake".to_string());
    config.billing.stripe_webhook_secret = Some(WEBHOOK_SECRET.to_string());
    config.worker.enabled = false;
    configure(&mut config);
    config.validate().unwrap();

    let (orders_db, deployments_db) = db::setup_databases(&config.databases.orders_path, &config.databases.deployments_path)
        .await
        .unwrap();

    let gateway = Arc::new(MockGateway::new());
    let state = AppState {
        orders_db,
        deployments_db,
        cipher: Cipher::new(config.encryption.passphrase.as_deref().unwrap()).unwrap(),
        auth: Arc::new(AuthResolver::new(&config.auth).unwrap()),
        gateway: Some(gateway.clone()),
        hooks: StoreHooks::new(),
        config,
    };

    let server = TestServer::new(build_router(state.clone())).unwrap();
    TestApp {
        server,
        state,
        gateway,
        _dir: dir,
    }
}

fn checkout_body() -> Value {
    json!({
        "planId": "hetzner-cx23-launch",
        "deployment": {
            "name": "My Claw",
            "authChoice": "anthropic",
            "anthropicApiKey": "sk-ant-e2e",
            "discordBotToken": "bot-e2e"
        },
        "customerEmail": "buyer@example.com"
    })
}

fn event_body(event_id: &str, event_type: &str, session_id: &str, payment_status: &str) -> String {
    json!({
        "id": event_id,
        "type": event_type,
        "data": {"object": {
            "id": session_id,
            "payment_status": payment_status,
            "payment_intent": "pi_e2e_1",
            "customer": "cus_e2e_1",
            "customer_details": {"email": "buyer@example.com"}
        }}
    })
    .to_string()
}

async fn deliver_webhook(app: &TestApp, body: &str) -> axum_test::TestResponse {
    let signature = sign_payload(WEBHOOK_SECRET, chrono::Utc::now().timestamp(), body.as_bytes());
    app.server
        .post("/v1/webhooks/stripe")
        .add_header("stripe-signature", signature)
        .add_header("content-type", "application/json")
        .bytes(body.to_string().into())
        .await
}

async fn list_deployments(app: &TestApp) -> Vec<Value> {
    let response = app.server.get("/v1/deployments").await;
    assert_eq!(response.status_code(), 200);
    response.json::<Value>()["deployments"].as_array().unwrap().clone()
}

async fn order_status(app: &TestApp, order_id: &str) -> String {
    let response = app.server.get(&format!("/v1/orders/{order_id}")).await;
    assert_eq!(response.status_code(), 200);
    response.json::<Value>()["order"]["status"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let app = test_app(|_| {}).await;
    let response = app.server.get("/health").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["ok"], json!(true));
}

#[tokio::test]
async fn test_control_plane_health_reports_issues() {
    let app = test_app(|config| {
        config.worker.enabled = false;
    })
    .await;

    let response = app.server.get("/v1/control-plane/health").await;
    assert_eq!(response.status_code(), 200);
    let body = response.json::<Value>();
    // Worker disabled and no provisioner token: not fully ready
    assert_eq!(body["ok"], json!(false));
    assert!(!body["issues"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_s1_happy_paid_path() {
    let app = test_app(|_| {}).await;

    let response = app
        .server
        .post("/v1/billing/checkout")
        .add_header("idempotency-key", "K1")
        .json(&checkout_body())
        .await;
    assert_eq!(response.status_code(), 201);
    let body = response.json::<Value>();
    assert_eq!(body["order"]["status"], json!("pending_payment"));
    let order_id = body["order"]["id"].as_str().unwrap().to_string();
    let session_id = body["order"]["checkoutSessionId"].as_str().unwrap().to_string();
    assert!(body["checkoutUrl"].as_str().unwrap().starts_with("https://pay.example/"));

    assert!(list_deployments(&app).await.is_empty());

    // Settlement webhook
    let webhook = deliver_webhook(&app, &event_body("evt_s1_1", "checkout.session.completed", &session_id, "paid")).await;
    assert_eq!(webhook.status_code(), 200);
    let webhook_body = webhook.json::<Value>();
    assert_eq!(webhook_body["pendingAsyncPayment"], json!(false));

    assert_eq!(order_status(&app, &order_id).await, "deployment_created");

    let deployments = list_deployments(&app).await;
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0]["billingRef"].as_str().unwrap(), order_id);
    assert_eq!(deployments[0]["status"], json!("pending"));
    // Default tenant owns webhook-driven deployments
    assert_eq!(deployments[0]["ownerUserId"], json!("default"));

    // Replay of the same event id is deduplicated
    let replay = deliver_webhook(&app, &event_body("evt_s1_1", "checkout.session.completed", &session_id, "paid")).await;
    assert_eq!(replay.status_code(), 200);
    assert_eq!(replay.json::<Value>()["duplicate"], json!(true));
    assert_eq!(list_deployments(&app).await.len(), 1);
}

#[tokio::test]
async fn test_s2_unpaid_completion_waits() {
    let app = test_app(|_| {}).await;

    let response = app.server.post("/v1/billing/checkout").json(&checkout_body()).await;
    assert_eq!(response.status_code(), 201);
    let body = response.json::<Value>();
    let order_id = body["order"]["id"].as_str().unwrap().to_string();
    let session_id = body["order"]["checkoutSessionId"].as_str().unwrap().to_string();

    // Completed but unpaid: no transition, flagged as pending async
    let webhook = deliver_webhook(&app, &event_body("evt_s2_1", "checkout.session.completed", &session_id, "unpaid")).await;
    assert_eq!(webhook.status_code(), 200);
    assert_eq!(webhook.json::<Value>()["pendingAsyncPayment"], json!(true));

    assert_eq!(order_status(&app, &order_id).await, "pending_payment");
    assert!(list_deployments(&app).await.is_empty());

    // Async settlement arrives
    let webhook = deliver_webhook(
        &app,
        &event_body("evt_s2_2", "checkout.session.async_payment_succeeded", &session_id, "paid"),
    )
    .await;
    assert_eq!(webhook.status_code(), 200);

    assert_eq!(order_status(&app, &order_id).await, "deployment_created");
    assert_eq!(list_deployments(&app).await.len(), 1);
}

#[tokio::test]
async fn test_s3_async_failure_then_success() {
    let app = test_app(|_| {}).await;

    let response = app.server.post("/v1/billing/checkout").json(&checkout_body()).await;
    let body = response.json::<Value>();
    let order_id = body["order"]["id"].as_str().unwrap().to_string();
    let session_id = body["order"]["checkoutSessionId"].as_str().unwrap().to_string();

    let webhook = deliver_webhook(
        &app,
        &event_body("evt_s3_1", "checkout.session.async_payment_failed", &session_id, "unpaid"),
    )
    .await;
    assert_eq!(webhook.status_code(), 200);
    assert_eq!(order_status(&app, &order_id).await, "failed");

    // A later settlement recovers the order and bridges exactly once
    let webhook = deliver_webhook(
        &app,
        &event_body("evt_s3_2", "checkout.session.async_payment_succeeded", &session_id, "paid"),
    )
    .await;
    assert_eq!(webhook.status_code(), 200);

    assert_eq!(order_status(&app, &order_id).await, "deployment_created");
    assert_eq!(list_deployments(&app).await.len(), 1);
}

#[tokio::test]
async fn test_s4_idempotent_manual_provision() {
    let app = test_app(|config| {
        config.billing.auto_provision_on_paid = false;
    })
    .await;

    let response = app.server.post("/v1/billing/checkout").json(&checkout_body()).await;
    let body = response.json::<Value>();
    let order_id = body["order"]["id"].as_str().unwrap().to_string();
    let session_id = body["order"]["checkoutSessionId"].as_str().unwrap().to_string();

    deliver_webhook(&app, &event_body("evt_s4_1", "checkout.session.completed", &session_id, "paid")).await;
    assert_eq!(order_status(&app, &order_id).await, "paid");
    assert!(list_deployments(&app).await.is_empty());

    let first = app.server.post(&format!("/v1/orders/{order_id}/provision")).await;
    assert_eq!(first.status_code(), 200);
    let first_body = first.json::<Value>();
    assert_eq!(first_body["created"], json!(true));
    let deployment_id = first_body["deploymentId"].as_str().unwrap().to_string();

    let second = app.server.post(&format!("/v1/orders/{order_id}/provision")).await;
    assert_eq!(second.status_code(), 200);
    let second_body = second.json::<Value>();
    assert_eq!(second_body["created"], json!(false));
    assert_eq!(second_body["deploymentId"].as_str().unwrap(), deployment_id);

    assert_eq!(list_deployments(&app).await.len(), 1);
    assert_eq!(order_status(&app, &order_id).await, "deployment_created");
}

#[tokio::test]
async fn test_provision_refuses_unpaid_order() {
    let app = test_app(|_| {}).await;

    let response = app.server.post("/v1/billing/checkout").json(&checkout_body()).await;
    let order_id = response.json::<Value>()["order"]["id"].as_str().unwrap().to_string();

    let refused = app.server.post(&format!("/v1/orders/{order_id}/provision")).await;
    assert_eq!(refused.status_code(), 409);
    assert_eq!(refused.json::<Value>()["ok"], json!(false));
}

#[tokio::test]
async fn test_idempotency_key_replays_and_conflicts() {
    let app = test_app(|_| {}).await;

    let first = app
        .server
        .post("/v1/billing/checkout")
        .add_header("idempotency-key", "K-replay")
        .json(&checkout_body())
        .await;
    assert_eq!(first.status_code(), 201);
    let first_body = first.json::<Value>();

    // Identical request replays the stored response byte-for-byte
    let replay = app
        .server
        .post("/v1/billing/checkout")
        .add_header("idempotency-key", "K-replay")
        .json(&checkout_body())
        .await;
    assert_eq!(replay.status_code(), 200);
    assert_eq!(replay.json::<Value>(), first_body);

    // Only one order was created
    let orders = app.server.get("/v1/orders").await.json::<Value>();
    assert_eq!(orders["orders"].as_array().unwrap().len(), 1);

    // Same key, different body: 409
    let mut different = checkout_body();
    different["customerEmail"] = json!("other@example.com");
    let conflict = app
        .server
        .post("/v1/billing/checkout")
        .add_header("idempotency-key", "K-replay")
        .json(&different)
        .await;
    assert_eq!(conflict.status_code(), 409);
}

#[tokio::test]
async fn test_idempotency_key_charset_enforced() {
    let app = test_app(|_| {}).await;

    let response = app
        .server
        .post("/v1/billing/checkout")
        .add_header("idempotency-key", "bad key with spaces")
        .json(&checkout_body())
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_checkout_failure_releases_idempotency_key(){
    let app = test_app(|_| {}).await;
    app.gateway.fail_sessions.store(true, Ordering::SeqCst);

    let failed = app
        .server
        .post("/v1/billing/checkout")
        .add_header("idempotency-key", "K-retry")
        .json(&checkout_body())
        .await;
    assert_eq!(failed.status_code(), 502);

    // The key is reusable once the downstream failure clears
    app.gateway.fail_sessions.store(false, Ordering::SeqCst);
    let retried = app
        .server
        .post("/v1/billing/checkout")
        .add_header("idempotency-key", "K-retry")
        .json(&checkout_body())
        .await;
    assert_eq!(retried.status_code(), 201);
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature_without_store_writes() {
    let app = test_app(|_| {}).await;

    let body = event_body("evt_forged", "checkout.session.completed", "cs_forged", "paid");
    let forged = sign_payload("whsec_wrong_secret", chrono::Utc::now().timestamp(), body.as_bytes());
    let response = app
        .server
        .post("/v1/webhooks/stripe")
        .add_header("stripe-signature", forged)
        .bytes(body.into())
        .await;
    assert_eq!(response.status_code(), 400);

    // No dedup entry was written
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stripe_webhook_events")
        .fetch_one(&app.state.orders_db)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_unknown_event_type_is_ignored() {
    let app = test_app(|_| {}).await;

    let body = json!({"id": "evt_other", "type": "invoice.created", "data": {"object": {"id": "in_1"}}}).to_string();
    let response = deliver_webhook(&app, &body).await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["ignored"], json!(true));

    let status: String = sqlx::query_scalar("SELECT status FROM stripe_webhook_events WHERE event_id = 'evt_other'")
        .fetch_one(&app.state.orders_db)
        .await
        .unwrap();
    assert_eq!(status, "ignored");
}

#[tokio::test]
async fn test_deployment_crud_and_owner_scoping() {
    let token_a = "tenant-a-token";
    let token_b = "tenant-b-token";
    let app = test_app(|config| {
        config.auth.mode = AuthMode::Token;
        config.auth.tokens = vec![
            TokenEntry {
                token_sha256: crate::auth::hash_token(token_a),
                user_id: "tenant-a".to_string(),
            },
            TokenEntry {
                token_sha256: crate::auth::hash_token(token_b),
                user_id: "tenant-b".to_string(),
            },
        ];
    })
    .await;

    // Unauthenticated requests bounce
    assert_eq!(app.server.get("/v1/deployments").await.status_code(), 401);

    let created = app
        .server
        .post("/v1/deployments")
        .add_header("authorization", format!("Bearer {token_a}"))
        .json(&checkout_body()["deployment"])
        .await;
    assert_eq!(created.status_code(), 201);
    let deployment = created.json::<Value>()["deployment"].clone();
    let deployment_id = deployment["id"].as_str().unwrap().to_string();
    assert_eq!(deployment["name"], json!("my-claw"));
    assert_eq!(deployment["status"], json!("pending"));

    // Owner sees it; the other tenant doesn't
    let response = app
        .server
        .get(&format!("/v1/deployments/{deployment_id}"))
        .add_header("authorization", format!("Bearer {token_a}"))
        .await;
    assert_eq!(response.status_code(), 200);

    let foreign = app
        .server
        .get(&format!("/v1/deployments/{deployment_id}"))
        .add_header("authorization", format!("Bearer {token_b}"))
        .await;
    assert_eq!(foreign.status_code(), 404);

    let foreign_cancel = app
        .server
        .post(&format!("/v1/deployments/{deployment_id}/cancel"))
        .add_header("authorization", format!("Bearer {token_b}"))
        .await;
    assert_eq!(foreign_cancel.status_code(), 404);

    // Owner cancels the pending deployment outright
    let canceled = app
        .server
        .post(&format!("/v1/deployments/{deployment_id}/cancel"))
        .add_header("authorization", format!("Bearer {token_a}"))
        .await;
    assert_eq!(canceled.status_code(), 200);
    assert_eq!(canceled.json::<Value>()["deployment"]["status"], json!("canceled"));

    // Retry returns it to the queue
    let retried = app
        .server
        .post(&format!("/v1/deployments/{deployment_id}/retry"))
        .add_header("authorization", format!("Bearer {token_a}"))
        .await;
    assert_eq!(retried.status_code(), 200);
    assert_eq!(retried.json::<Value>()["deployment"]["status"], json!("pending"));

    // Retrying a pending deployment is a conflict
    let conflict = app
        .server
        .post(&format!("/v1/deployments/{deployment_id}/retry"))
        .add_header("authorization", format!("Bearer {token_a}"))
        .await;
    assert_eq!(conflict.status_code(), 409);
}

#[tokio::test]
async fn test_deployment_validation_maps_to_400() {
    let app = test_app(|_| {}).await;

    let response = app
        .server
        .post("/v1/deployments")
        .json(&json!({
            "name": "bot",
            "authChoice": "anthropic",
            "discordGroupPolicy": "allowlist"
        }))
        .await;
    assert_eq!(response.status_code(), 400);
    let body = response.json::<Value>();
    assert_eq!(body["ok"], json!(false));
    let fields: Vec<&str> = body["details"]["fields"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"anthropicApiKey"));
    assert!(fields.contains(&"discordGuildId"));
    assert!(fields.contains(&"discordChannels"));
}

#[tokio::test]
async fn test_unknown_plan_rejected() {
    let app = test_app(|_| {}).await;

    let mut body = checkout_body();
    body["planId"] = json!("no-such-plan");
    let response = app.server.post("/v1/billing/checkout").json(&body).await;
    assert_eq!(response.status_code(), 400);
}
