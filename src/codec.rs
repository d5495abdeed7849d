//! Binary column codec.
//!
//! Outbound binary fields are always written as standard base64. Inbound
//! `bytea` columns arrive in whatever shape the producing client library
//! chose, so decoding accepts, in order:
//!
//! 1. a tagged buffer object `{"type": "Buffer", "data": [1, 2, 3]}`
//! 2. a base64 string
//! 3. a Postgres hex escape `\x48656c6c6f`, whose payload may itself be
//!    base64 text from producers that double-encode
//! 4. any other string, taken as its raw UTF-8 bytes
//!
//! Decoding never fails on a present field; it returns `None` only when the
//! field is absent or JSON null.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

/// Prefix Postgres uses for hex-escaped byte arrays
const HEX_ESCAPE_PREFIX: &str = "\\x";

/// Encode bytes into the canonical wire form (base64)
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Encode an optional binary field
pub fn encode_opt(bytes: Option<&[u8]>) -> Option<String> {
    bytes.map(encode)
}

/// Decode a binary field from any of the tolerated wire shapes
pub fn decode(value: Option<&Value>) -> Option<Vec<u8>> {
    match value? {
        Value::Null => None,
        Value::Object(map) => {
            let tagged_buffer = map.get("type").and_then(Value::as_str) == Some("Buffer");
            match (tagged_buffer, map.get("data")) {
                (true, Some(Value::Array(items))) => Some(buffer_bytes(items)),
                // Unrecognized object: keep its text so nothing is silently lost
                _ => Some(value_text_bytes(&Value::Object(map.clone()))),
            }
        }
        Value::Array(items) => Some(buffer_bytes(items)),
        Value::String(s) => Some(decode_str(s)),
        other => Some(value_text_bytes(other)),
    }
}

/// Decode a binary field given as a plain string
pub fn decode_str(s: &str) -> Vec<u8> {
    if let Ok(bytes) = STANDARD.decode(s) {
        return bytes;
    }

    if let Some(hex_digits) = s.strip_prefix(HEX_ESCAPE_PREFIX) {
        if let Ok(raw) = hex::decode(hex_digits) {
            return unwrap_double_encoding(raw);
        }
    }

    s.as_bytes().to_vec()
}

/// Hex payloads sometimes carry base64 text instead of the bytes themselves.
fn unwrap_double_encoding(raw: Vec<u8>) -> Vec<u8> {
    match std::str::from_utf8(&raw) {
        Ok(text) => match STANDARD.decode(text.trim()) {
            Ok(inner) => inner,
            Err(_) => raw,
        },
        Err(_) => raw,
    }
}

fn buffer_bytes(items: &[Value]) -> Vec<u8> {
    items
        .iter()
        .filter_map(Value::as_u64)
        .map(|b| b.min(u8::MAX as u64) as u8)
        .collect()
}

fn value_text_bytes(value: &Value) -> Vec<u8> {
    value.to_string().into_bytes()
}
