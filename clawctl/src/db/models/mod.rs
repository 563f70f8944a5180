pub mod deployments;
pub mod idempotency;
pub mod orders;
pub mod webhook_events;
