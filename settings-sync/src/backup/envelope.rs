//! Backup envelope codec.
//!
//! Wire format: a JSON object with `ts` (capture time in epoch milliseconds)
//! and `data` (the settings record). Other top-level keys are ignored on
//! read so envelopes written by older or foreign clients still load.

use crate::store::{json_kind, SettingsMap};
use crate::utils::errors::{Result, SyncError};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

/// Decoded backup
#[derive(Debug, Clone, PartialEq)]
pub struct BackupEnvelope {
    /// When the snapshot was taken (epoch ms)
    pub captured_at_ms: i64,
    pub payload: SettingsMap,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    ts: i64,
    data: &'a SettingsMap,
}

/// Wrap a settings snapshot stamped with the current time
pub fn encode(payload: &SettingsMap) -> Result<String> {
    encode_at(payload, Utc::now().timestamp_millis())
}

pub fn encode_at(payload: &SettingsMap, captured_at_ms: i64) -> Result<String> {
    let text = serde_json::to_string(&WireEnvelope {
        ts: captured_at_ms,
        data: payload,
    })?;
    Ok(text)
}

/// Parse and validate an envelope.
///
/// Unparseable text, a non-object document or a missing `data` field is
/// [`SyncError::MalformedEnvelope`]; a `data` field that is not an object is
/// [`SyncError::EmptyPayload`]. A missing or non-numeric `ts` reads as now.
pub fn decode(raw: &[u8]) -> Result<BackupEnvelope> {
    let document: Value = serde_json::from_slice(raw)
        .map_err(|e| SyncError::MalformedEnvelope(format!("not valid JSON: {}", e)))?;

    let mut document = match document {
        Value::Object(document) => document,
        other => {
            return Err(SyncError::MalformedEnvelope(format!(
                "expected an object, found {}",
                json_kind(&other)
            )))
        }
    };

    let payload = match document.remove("data") {
        Some(Value::Object(payload)) => payload,
        Some(_) => return Err(SyncError::EmptyPayload),
        None => {
            return Err(SyncError::MalformedEnvelope(
                "missing \"data\" field".to_string(),
            ))
        }
    };

    let captured_at_ms = document
        .get("ts")
        .and_then(timestamp_ms)
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    Ok(BackupEnvelope {
        captured_at_ms,
        payload,
    })
}

fn timestamp_ms(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}
