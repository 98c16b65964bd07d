//! Serde helpers and small parsing utilities shared by the adapters.
//!
//! LND's REST gateway encodes 64-bit integers as JSON strings while the public
//! directory and aggregator APIs use plain numbers, so most integer fields go
//! through the lenient deserializers below.

use std::str::FromStr;

use secp256k1::PublicKey;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::errors::AdapterError;

/// Deserializes a `u64` from a number, a numeric string, or null (as 0).
pub fn de_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .ok_or_else(|| de::Error::custom(format!("expected unsigned integer, got {}", n))),
        Value::String(s) if s.is_empty() => Ok(0),
        Value::String(s) => s.parse::<u64>().map_err(de::Error::custom),
        other => Err(de::Error::custom(format!(
            "expected unsigned integer, got {}",
            other
        ))),
    }
}

/// Same as [`de_u64`] but for signed values.
pub fn de_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| de::Error::custom(format!("expected integer, got {}", n))),
        Value::String(s) if s.is_empty() => Ok(0),
        Value::String(s) => s.parse::<i64>().map_err(de::Error::custom),
        other => Err(de::Error::custom(format!("expected integer, got {}", other))),
    }
}

/// Deserializes an identifier that may arrive as a string or a number
/// (short channel ids are routinely sent both ways).
pub fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number identifier, got {}",
            other
        ))),
    }
}

/// Reads an identifier-like field out of a loosely typed payload.
pub fn value_id(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads an integer field that may be encoded as a number or a string.
pub fn value_u64(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn value_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parses and validates a hex-encoded compressed secp256k1 node identity.
pub fn parse_node_id(pubkey: &str) -> Result<PublicKey, AdapterError> {
    PublicKey::from_str(pubkey)
        .map_err(|err| AdapterError::Validation(format!("invalid node pubkey {}: {}", pubkey, err)))
}
