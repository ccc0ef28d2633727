//! Session-key derivation.
//!
//! Two requests belong to the same session when they share an explicit
//! `session_id`, or failing that, the same first message and sequence
//! length. Including the length keeps successive turns of a tool-calling
//! loop from colliding: each round trip grows the sequence.

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

const SHORT_HASH_LEN: usize = 16;

pub fn session_key(body: &JsonValue) -> String {
    if let Some(session_id) = body.get("session_id").and_then(|value| value.as_str()) {
        return session_id.to_string();
    }

    if let Some(messages) = body.get("messages").and_then(|value| value.as_array()) {
        if let Some(first) = messages.first() {
            return format!("msg_{}_{}", messages.len(), short_hash_value(first));
        }
    }

    match body.get("input") {
        Some(JsonValue::Array(items)) => {
            if let Some(first) = items.first() {
                return format!("input_{}_{}", items.len(), short_hash_value(first));
            }
        }
        Some(JsonValue::String(text)) => {
            return format!("input_1_{}", short_hash(text.as_bytes()));
        }
        _ => {}
    }

    format!("req_{}", short_hash_value(body))
}

/// Full content hash of the raw body, for duplicate detection.
pub fn content_hash(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    hex(&digest)
}

fn short_hash_value(value: &JsonValue) -> String {
    let serialised = serde_json::to_vec(value).unwrap_or_default();
    short_hash(&serialised)
}

fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = hex(&digest);
    out.truncate(SHORT_HASH_LEN);
    out
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
