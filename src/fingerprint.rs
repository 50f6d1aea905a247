//! Deterministic request fingerprints for prefix caching.
//!
//! A fingerprint is the SHA-256 hex digest of the canonical JSON form of
//! `(provider, model, system, knowledge, history, params)`. Canonicalisation:
//!
//! - primitives pass through;
//! - objects are rebuilt with sorted keys, arrays recurse;
//! - any `url` / `image_url` string value beginning with `data:image` is
//!   replaced by `"image_hash:" + sha256(value)[..16]` so inline images do
//!   not blow up key size;
//! - everything else stringifies.
//!
//! Two requests with the same semantic content must yield the same digest.
//! Serialisation failure after normalisation is a contract violation and
//! fails fast with `InvalidRequest`.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{LlmError, Result};
use crate::traits::{ChatMessage, CompletionParams};

/// Hex-encode a byte slice.
fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// SHA-256 hex digest of a string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    to_hex(&hasher.finalize())
}

fn is_inline_image(key: &str, value: &Value) -> bool {
    matches!(key, "url" | "image_url")
        && value
            .as_str()
            .is_some_and(|s| s.starts_with("data:image"))
}

fn normalize_entry(key: &str, value: &Value) -> Value {
    if is_inline_image(key, value) {
        let data = value.as_str().unwrap_or_default();
        return Value::String(format!("image_hash:{}", &sha256_hex(data)[..16]));
    }
    normalize(value)
}

/// Recursively canonicalise a JSON value.
///
/// Object keys are sorted; inline image payloads are collapsed to short
/// hashes. The output is stable across insertion order.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), normalize_entry(key, &map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Compute the fingerprint for a request prefix.
pub fn fingerprint(
    provider: &str,
    model: &str,
    system: &str,
    knowledge: &str,
    history: &[ChatMessage],
    params: &CompletionParams,
) -> Result<String> {
    let composed = serde_json::json!({
        "provider": provider,
        "model": model,
        "system": system,
        "knowledge": knowledge,
        "history": serde_json::to_value(history)?,
        "params": serde_json::to_value(params)?,
    });
    let canonical = normalize(&composed);
    let serialized = serde_json::to_string(&canonical)
        .map_err(|e| LlmError::InvalidRequest(format!("fingerprint serialization failed: {}", e)))?;
    Ok(sha256_hex(&serialized))
}
