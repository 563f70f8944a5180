//! Hetzner Cloud API client.
//!
//! Thin REST wrapper over the endpoints the provision and destroy protocols
//! need: SSH keys, servers, and action polling. Uses bearer auth and JSON
//! bodies throughout.

use super::{CreateServerRequest, CreatedServer, ProvisionerClient, ProvisionerError, Result, Server, SshKeyHandle};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const ACTION_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct HetznerClient {
    api_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl HetznerClient {
    pub fn new(api_token: String, api_base: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create Hetzner HTTP client");

        Self {
            api_token,
            api_base,
            client,
        }
    }

    async fn request(&self, method: reqwest::Method, path: &str, body: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.api_base))
            .bearer_auth(&self.api_token);

        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder.send().await.map_err(|e| ProvisionerError::Transport(e.to_string()))?;
        let status = response.status();

        if status.as_u16() == 404 {
            return Err(ProvisionerError::NotFound);
        }

        let text = response.text().await.map_err(|e| ProvisionerError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_else(|| text.chars().take(200).collect());
            return Err(ProvisionerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        if text.is_empty() {
            return Ok(serde_json::Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| ProvisionerError::Transport(format!("unparseable provider response: {e}")))
    }
}

#[derive(Deserialize)]
struct ServerPayload {
    id: i64,
    name: String,
    public_net: Option<PublicNet>,
}

#[derive(Deserialize)]
struct PublicNet {
    ipv4: Option<Ipv4>,
}

#[derive(Deserialize)]
struct Ipv4 {
    ip: Option<String>,
}

impl ServerPayload {
    fn public_ip(&self) -> Option<String> {
        self.public_net.as_ref()?.ipv4.as_ref()?.ip.clone()
    }
}

#[async_trait]
impl ProvisionerClient for HetznerClient {
    async fn register_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKeyHandle> {
        let body = self
            .request(
                reqwest::Method::POST,
                "/ssh_keys",
                Some(json!({ "name": name, "public_key": public_key })),
            )
            .await?;

        let id = body
            .pointer("/ssh_key/id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ProvisionerError::Transport("ssh key response missing id".to_string()))?;

        tracing::debug!(ssh_key_id = id, name, "Registered SSH key");
        Ok(SshKeyHandle { id: id.to_string() })
    }

    async fn remove_ssh_key(&self, id: &str) -> Result<()> {
        self.request(reqwest::Method::DELETE, &format!("/ssh_keys/{id}"), None).await?;
        Ok(())
    }

    async fn create_server(&self, request: &CreateServerRequest) -> Result<CreatedServer> {
        let ssh_key_id: i64 = request
            .ssh_key_id
            .parse()
            .map_err(|_| ProvisionerError::Transport(format!("non-numeric ssh key id {:?}", request.ssh_key_id)))?;

        let labels: serde_json::Map<String, serde_json::Value> = request
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();

        let body = self
            .request(
                reqwest::Method::POST,
                "/servers",
                Some(json!({
                    "name": request.name,
                    "server_type": request.server_type,
                    "image": request.image,
                    "location": request.location,
                    "ssh_keys": [ssh_key_id],
                    "labels": labels,
                })),
            )
            .await?;

        let server: ServerPayload = serde_json::from_value(body.get("server").cloned().unwrap_or_default())
            .map_err(|e| ProvisionerError::Transport(format!("malformed server response: {e}")))?;
        let action_id = body.pointer("/action/id").and_then(|v| v.as_i64());

        tracing::info!(server_id = server.id, name = %server.name, "Created server");
        Ok(CreatedServer {
            id: server.id.to_string(),
            public_ip: server.public_ip(),
            name: server.name,
            action_id,
        })
    }

    async fn delete_server(&self, id: &str) -> Result<()> {
        self.request(reqwest::Method::DELETE, &format!("/servers/{id}"), None).await?;
        Ok(())
    }

    async fn get_server(&self, id: &str) -> Result<Server> {
        let body = self.request(reqwest::Method::GET, &format!("/servers/{id}"), None).await?;
        let server: ServerPayload = serde_json::from_value(body.get("server").cloned().unwrap_or_default())
            .map_err(|e| ProvisionerError::Transport(format!("malformed server response: {e}")))?;

        Ok(Server {
            id: server.id.to_string(),
            public_ip: server.public_ip(),
            name: server.name,
        })
    }

    async fn wait_for_action(&self, action_id: i64, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let body = self.request(reqwest::Method::GET, &format!("/actions/{action_id}"), None).await?;
            match body.pointer("/action/status").and_then(|v| v.as_str()) {
                Some("success") => return Ok(()),
                Some("error") => {
                    let message = body
                        .pointer("/action/error/message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("action failed")
                        .to_string();
                    return Err(ProvisionerError::Api { status: 200, message });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ProvisionerError::Timeout {
                    waiting_for: format!("action {action_id}"),
                });
            }
            tokio::time::sleep(ACTION_POLL_INTERVAL).await;
        }
    }
}
