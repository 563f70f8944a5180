//! Cloud provider abstraction.
//!
//! The provision and destroy protocols talk to this seam; the concrete
//! client ([`hetzner::HetznerClient`]) is one implementation and worker
//! tests substitute mocks. A provider "not found" is its own variant because
//! the cleanup path treats deleting an already-gone resource as success.

pub mod hetzner;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionerError {
    /// The resource does not exist (HTTP 404). Cleanup counts this as done.
    #[error("resource not found")]
    NotFound,

    /// The provider rejected the call
    #[error("provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A bounded wait expired
    #[error("timed out waiting for {waiting_for}")]
    Timeout { waiting_for: String },

    /// Transport-level failure
    #[error("provider request failed: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, ProvisionerError>;

/// Registered SSH key handle.
#[derive(Debug, Clone)]
pub struct SshKeyHandle {
    pub id: String,
}

/// Shape of the server to create.
#[derive(Debug, Clone)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    pub ssh_key_id: String,
    pub labels: Vec<(String, String)>,
}

/// A created server and the asynchronous provider action tracking it, if any.
#[derive(Debug, Clone)]
pub struct CreatedServer {
    pub id: String,
    pub name: String,
    pub public_ip: Option<String>,
    pub action_id: Option<i64>,
}

/// Current server state.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub public_ip: Option<String>,
}

/// Narrow interface over the compute provider.
#[async_trait]
pub trait ProvisionerClient: Send + Sync {
    async fn register_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKeyHandle>;

    async fn remove_ssh_key(&self, id: &str) -> Result<()>;

    async fn create_server(&self, request: &CreateServerRequest) -> Result<CreatedServer>;

    async fn delete_server(&self, id: &str) -> Result<()>;

    async fn get_server(&self, id: &str) -> Result<Server>;

    /// Block until the provider action completes, up to `timeout`.
    async fn wait_for_action(&self, action_id: i64, timeout: Duration) -> Result<()>;
}
