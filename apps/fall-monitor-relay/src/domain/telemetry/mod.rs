//! Telemetry Normalization
//!
//! Devices publish in several encodings: JSON objects, JSON arrays, and bare
//! numerals such as `72` or `98.5`. Everything is converted into one canonical
//! [`NormalizedEvent`] shape before classification and fan-out.
//!
//! # Rules
//!
//! - A JSON object, array, string, boolean, or null is passed through
//!   unchanged, including nested structure.
//! - A bare numeral (a top-level JSON number, or text that parses as a finite
//!   float such as `+5` or `.5`) becomes `{"value": <number>}`.
//! - Anything else, including an empty body, is rejected. The caller drops
//!   the message.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// One broker delivery, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Wire topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes.
    pub body: Bytes,
}

impl RawMessage {
    /// Create a raw message.
    #[must_use]
    pub fn new(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
        }
    }

    /// Lossy UTF-8 preview of the body for diagnostics, truncated to `max` chars.
    #[must_use]
    pub fn preview(&self, max: usize) -> String {
        String::from_utf8_lossy(&self.body).chars().take(max).collect()
    }
}

/// Canonical event pushed to clients on the `mqtt-data` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Wire topic.
    pub topic: String,
    /// Parsed payload.
    pub data: Value,
    /// ISO-8601 UTC time the relay processed the message.
    pub timestamp: String,
}

impl NormalizedEvent {
    /// Build an event stamped with the given time.
    #[must_use]
    pub fn new(topic: impl Into<String>, data: Value, at: DateTime<Utc>) -> Self {
        Self {
            topic: topic.into(),
            data,
            timestamp: iso_timestamp(at),
        }
    }
}

/// Operator-injected emergency alert pushed on the `emergency-alert` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyAlert {
    /// Who should be contacted.
    pub contact: String,
    /// Free-form alert text.
    pub message: String,
    /// ISO-8601 UTC time the alert was injected.
    pub timestamp: String,
}

impl EmergencyAlert {
    /// Build an alert stamped with the given time.
    #[must_use]
    pub fn new(contact: impl Into<String>, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            contact: contact.into(),
            message: message.into(),
            timestamp: iso_timestamp(at),
        }
    }
}

/// Format a time as ISO-8601 with millisecond precision and a `Z` suffix.
#[must_use]
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Convert a raw body into a canonical value.
///
/// Returns `None` when the body is neither structured data nor a numeral.
#[must_use]
pub fn normalize(body: &[u8]) -> Option<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Number(number)) => Some(wrap_numeral(number)),
        Ok(value) => Some(value),
        Err(_) => parse_numeral(body).map(wrap_numeral),
    }
}

fn parse_numeral(body: &[u8]) -> Option<Number> {
    let text = std::str::from_utf8(body).ok()?.trim();
    let parsed: f64 = text.parse().ok()?;
    // Rejects NaN and infinities, which also parse as f64.
    Number::from_f64(parsed)
}

fn wrap_numeral(number: Number) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert("value".to_string(), Value::Number(number));
    Value::Object(map)
}

// =============================================================================
// Tests
// =============================================================================
