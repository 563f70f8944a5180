//! Repository implementations for database access.
//!
//! Each repository wraps a SQLx connection, provides strongly-typed
//! operations for one entity family, and returns domain models from
//! [`crate::db::models`]. State transitions are predicated updates (source
//! state in the WHERE clause); an update that matches nothing re-reads and
//! returns the current row so callers treat "already done" and "did it now"
//! identically.

pub mod deployments;
pub mod idempotency;
pub mod orders;
pub mod webhook_events;

pub use deployments::Deployments;
pub use idempotency::CheckoutIdempotency;
pub use orders::Orders;
pub use webhook_events::WebhookEvents;
