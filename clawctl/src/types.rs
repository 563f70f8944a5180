//! Common type definitions shared across the crate.
//!
//! Entity ids are UUIDs wrapped in type aliases:
//!
//! - [`OrderId`]: billing order identifier
//! - [`DeploymentId`]: deployment lifecycle record identifier
//!
//! Tenant identifiers ([`UserId`]) are opaque strings because they come from
//! whatever the configured auth mode produces (a JWT subject claim, a token
//! binding, or the configured default tenant).

use uuid::Uuid;

// Type aliases for IDs
pub type OrderId = Uuid;
pub type DeploymentId = Uuid;
pub type UserId = String;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// All persisted timestamps (including lease expiries) use this
/// representation so that SQL comparisons stay integer comparisons.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Build a worker identity for this process: `worker-<pid>-<uuid>`.
pub fn generate_worker_id() -> String {
    format!("worker-{}-{}", std::process::id(), Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbrev_uuid() {
        let id: Uuid = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        assert_eq!(abbrev_uuid(&id), "550e8400");
    }

    #[test]
    fn test_worker_id_format() {
        let id = generate_worker_id();
        assert!(id.starts_with("worker-"));
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].parse::<u32>().is_ok());
    }
}
