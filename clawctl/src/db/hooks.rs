//! Best-effort change fan-out.
//!
//! Mutating paths publish "deployment changed" and "event appended"
//! notifications. Delivery is strictly best-effort: publishing never blocks
//! a store transaction, a lagging subscriber loses old notifications, and an
//! optional external mirror receives them over HTTP with bounded retries -
//! failures are logged and dropped.

use crate::types::DeploymentId;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 256;
const MIRROR_RETRIES: u32 = 3;
const MIRROR_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookEvent {
    DeploymentChanged { deployment_id: DeploymentId },
    EventAppended { deployment_id: DeploymentId, event_type: String },
}

/// Cloneable publisher handle. Subscribers are decoupled through a broadcast
/// channel so a slow consumer can never stall the publisher.
#[derive(Clone)]
pub struct StoreHooks {
    tx: broadcast::Sender<HookEvent>,
}

impl Default for StoreHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreHooks {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Fire-and-forget publish. With no subscribers this is a no-op.
    pub fn publish(&self, event: HookEvent) {
        let _ = self.tx.send(event);
    }

    pub fn deployment_changed(&self, deployment_id: DeploymentId) {
        self.publish(HookEvent::DeploymentChanged { deployment_id });
    }

    pub fn event_appended(&self, deployment_id: DeploymentId, event_type: &str) {
        self.publish(HookEvent::EventAppended {
            deployment_id,
            event_type: event_type.to_string(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HookEvent> {
        self.tx.subscribe()
    }
}

/// Forward hook events to an external mirror URL until shutdown. Each event
/// gets a few delivery attempts; exhausted events are dropped with a log line.
pub async fn run_mirror(hooks: StoreHooks, mirror_url: url::Url, shutdown: CancellationToken) {
    let client = match reqwest::Client::builder().timeout(MIRROR_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to build mirror HTTP client, mirror disabled");
            return;
        }
    };

    let mut rx = hooks.subscribe();
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Hook mirror lagged, notifications dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let mut delivered = false;
        for attempt in 0..MIRROR_RETRIES {
            match client.post(mirror_url.clone()).json(&event).send().await {
                Ok(response) if response.status().is_success() => {
                    delivered = true;
                    break;
                }
                Ok(response) => {
                    debug!(status = %response.status(), attempt, "Mirror rejected hook event");
                }
                Err(e) => {
                    debug!(error = %e, attempt, "Mirror delivery failed");
                }
            }
            tokio::time::sleep(Duration::from_millis(200 * (attempt as u64 + 1))).await;
        }

        if !delivered {
            warn!(?event, "Dropping hook event after {MIRROR_RETRIES} failed mirror deliveries");
        }
    }

    debug!("Hook mirror task exited");
}
