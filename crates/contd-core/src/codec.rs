//! Canonical JSON encoding and SHA-256 checksums
//!
//! Every checksum in the system is computed over this encoding, so two
//! implementations that agree on the canonical form agree on checksums.
//! Rules: object keys sorted lexicographically, no insignificant
//! whitespace, numbers and strings in serde_json's compact form.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Encode a JSON value in canonical form.
///
/// Object keys are emitted in lexicographic order at every nesting level;
/// array order is preserved. Scalars use serde_json's compact rendering,
/// which is stable for a given logical value.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (key, val) in map {
                sorted.insert(key, to_canonical_json(val));
            }
            let parts: Vec<String> = sorted
                .into_iter()
                .map(|(key, val)| format!("{}:{}", Value::String(key.clone()), val))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        // Null, booleans, numbers, and strings already render canonically.
        _ => value.to_string(),
    }
}

/// SHA-256 over the canonical encoding, as lowercase hex.
pub fn checksum_hex(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(to_canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 over raw bytes, as lowercase hex. Used for external state blobs.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Check a value against an expected checksum.
pub fn verify_checksum(value: &Value, expected: &str) -> bool {
    checksum_hex(value) == expected
}
