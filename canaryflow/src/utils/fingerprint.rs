//! Content fingerprinting for configurations and change-spec shapes.

use sha2::{Digest, Sha256};

/// Computes a stable hex fingerprint for a JSON value.
///
/// Object keys are sorted before hashing so logically equal
/// configurations produce the same fingerprint.
#[must_use]
pub fn fingerprint_value(value: &serde_json::Value) -> String {
    let canonical = canonicalize(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Computes the shape key for a set of change parameters.
///
/// The shape key hashes the parameter *names* (not values) together
/// with the given kind tag, so outcomes recorded for structurally
/// similar changes can be looked up later.
#[must_use]
pub fn shape_key(kind: &str, parameters: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut keys: Vec<&str> = parameters.keys().map(String::as_str).collect();
    keys.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    for key in keys {
        hasher.update(b"\x1f");
        hasher.update(key.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            let inner: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::String(k.clone()), canonicalize(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}
