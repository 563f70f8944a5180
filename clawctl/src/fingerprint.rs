//! Canonical request fingerprints for checkout idempotency.
//!
//! Two requests are "the same" when the hex SHA-256 of their canonical JSON
//! encodings match. Canonical means object keys are sorted lexicographically
//! at every level; arrays keep their declared order. Numbers and strings use
//! serde_json's standard rendering.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex SHA-256 over the canonical encoding of `value`.
pub fn fingerprint(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are JSON strings; reuse serde_json's escaping.
                out.push_str(&serde_json::to_string(key).expect("string serialization is infallible"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&serde_json::to_string(other).expect("scalar serialization is infallible"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_invariance() {
        let a = json!({"plan": "hetzner-cx23-launch", "email": "a@b.c", "deployment": {"name": "x", "channels": ["1", "2"]}});
        let b = json!({"deployment": {"channels": ["1", "2"], "name": "x"}, "email": "a@b.c", "plan": "hetzner-cx23-launch"});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_array_order_matters() {
        let a = json!({"channels": ["general", "ops"]});
        let b = json!({"channels": ["ops", "general"]});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_value_changes_change_fingerprint() {
        let a = json!({"plan": "hetzner-cx23-launch"});
        let b = json!({"plan": "hetzner-cx33-launch"});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_nested_objects_are_canonicalized() {
        let a = json!({"outer": {"b": 1, "a": {"d": 2, "c": 3}}});
        let b = json!({"outer": {"a": {"c": 3, "d": 2}, "b": 1}});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_output_is_hex_sha256() {
        let fp = fingerprint(&json!({}));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
