//! Event Classification
//!
//! Inspects a normalized payload together with its topic and reports the
//! semantically interesting cases: a manual activity-state change, a manual
//! fall trigger, or an automatic fall alert.
//!
//! Classification is observability only. It never filters or alters the
//! event that is broadcast to clients.

use serde_json::Value;

use super::topics::Topic;

// =============================================================================
// Activity State
// =============================================================================

/// Activity states selectable from the manual control topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityState {
    /// Standing or sitting still (code 1).
    Quieto,
    /// Walking (code 2).
    Caminando,
    /// Running (code 3).
    Corriendo,
}

impl ActivityState {
    /// Map a control code to a state.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Quieto),
            2 => Some(Self::Caminando),
            3 => Some(Self::Corriendo),
            _ => None,
        }
    }

    /// Upper-case label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quieto => "QUIETO",
            Self::Caminando => "CAMINANDO",
            Self::Corriendo => "CORRIENDO",
        }
    }
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of decoding the manual state control value.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualState {
    /// A recognised state code.
    Known(ActivityState),
    /// Any other value, passed through as received.
    Unmapped(Value),
}

impl std::fmt::Display for ManualState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(state) => state.fmt(f),
            Self::Unmapped(raw) => write!(f, "{raw}"),
        }
    }
}

// =============================================================================
// Classified Signal
// =============================================================================

/// Annotation derived from a single event.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedSignal {
    /// The manual state control topic carried a value.
    ManualStateChange {
        /// Decoded state.
        state: ManualState,
    },
    /// The manual fall control topic carried a value.
    ManualFallFlag {
        /// True when the value was `1`, which registers a fall.
        triggered: bool,
    },
    /// The automatic detector reported a fall.
    AutoFallAlert {
        /// `fall_count` as sent, if present.
        count: Option<Value>,
        /// `timestamp` as sent, if present.
        timestamp: Option<Value>,
    },
}

impl ClassifiedSignal {
    /// Metric label for this signal.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ManualStateChange { .. } => "manual_state",
            Self::ManualFallFlag { triggered: true } => "manual_fall",
            Self::ManualFallFlag { triggered: false } => "manual_fall_cleared",
            Self::AutoFallAlert { .. } => "auto_fall",
        }
    }

    /// Whether the signal represents a fall that should be alerted on.
    #[must_use]
    pub const fn is_fall(&self) -> bool {
        matches!(
            self,
            Self::ManualFallFlag { triggered: true } | Self::AutoFallAlert { .. }
        )
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Classify an event by topic and payload shape.
///
/// Returns `None` for topics with no classification rule, or when the
/// automatic fall topic reports no fall.
#[must_use]
pub fn classify(topic: &str, data: &Value) -> Option<ClassifiedSignal> {
    match Topic::from_wire(topic)? {
        Topic::ManualEstado => {
            let raw = control_value(data, "estado");
            let state = state_code(raw)
                .and_then(ActivityState::from_code)
                .map_or_else(|| ManualState::Unmapped(raw.clone()), ManualState::Known);
            Some(ClassifiedSignal::ManualStateChange { state })
        }
        Topic::ManualCaidas => {
            let raw = control_value(data, "caida");
            Some(ClassifiedSignal::ManualFallFlag {
                triggered: integer_code(raw) == Some(1),
            })
        }
        Topic::MatlabFall if data.get("fall_detected").is_some_and(is_truthy) => {
            Some(ClassifiedSignal::AutoFallAlert {
                count: data.get("fall_count").cloned(),
                timestamp: data.get("timestamp").cloned(),
            })
        }
        _ => None,
    }
}

/// Pick the control value: `value` first, then the topic-specific key, then
/// the payload itself. A key counts as present when it holds a non-null value.
fn control_value<'a>(data: &'a Value, fallback_key: &str) -> &'a Value {
    ["value", fallback_key]
        .into_iter()
        .find_map(|key| data.get(key).filter(|v| !v.is_null()))
        .unwrap_or(data)
}

/// Integral numeric code, accepting `2` and `2.0` alike.
fn integer_code(value: &Value) -> Option<i64> {
    if let Some(code) = value.as_i64() {
        return Some(code);
    }
    let float = value.as_f64()?;
    #[allow(clippy::cast_possible_truncation)]
    let truncated = float as i64;
    #[allow(clippy::cast_precision_loss)]
    let exact = (truncated as f64 - float).abs() < f64::EPSILON;
    exact.then_some(truncated)
}

/// State codes are also accepted as decimal strings, so `"2"` selects the
/// same state as `2`.
fn state_code(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.parse().ok(),
        other => integer_code(other),
    }
}

/// Loose truthiness: false, null, zero, empty string, and absence are false.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// =============================================================================
// Tests
// =============================================================================
