//! Topic Registry
//!
//! The relay listens to a fixed set of MQTT topics. Each topic has a logical
//! name (used in logs and in the health report) and a wire topic that must
//! match what the devices publish byte-for-byte.
//!
//! | logical name      | wire topic                    |
//! |-------------------|-------------------------------|
//! | `ESP32_IMU`       | `esp32/imu`                   |
//! | `ESP32_BIO`       | `esp32/bio`                   |
//! | `MANUAL_BPM`      | `fallmonitor/manual/bpm`      |
//! | `MANUAL_SPO2`     | `fallmonitor/manual/spo2`     |
//! | `MANUAL_ESTADO`   | `fallmonitor/manual/estado`   |
//! | `MANUAL_CAIDAS`   | `fallmonitor/manual/caidas`   |
//! | `MATLAB_ACTIVITY` | `fallmonitor/matlab/activity` |
//! | `MATLAB_FALL`     | `fallmonitor/matlab/fall`     |
//! | `MATLAB_HEALTH`   | `fallmonitor/esp32/health`    |

use serde::ser::{Serialize, Serializer};

// =============================================================================
// Topic
// =============================================================================

/// A known telemetry topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Raw inertial measurements from the wearable.
    Esp32Imu,
    /// Biometric readings from the wearable.
    Esp32Bio,
    /// Manually injected heart rate.
    ManualBpm,
    /// Manually injected oxygen saturation.
    ManualSpo2,
    /// Manual activity state control (1 = still, 2 = walking, 3 = running).
    ManualEstado,
    /// Manual fall trigger (1 = register a fall).
    ManualCaidas,
    /// Activity classification from the analysis pipeline.
    MatlabActivity,
    /// Automatic fall detection from the analysis pipeline.
    MatlabFall,
    /// Health summary computed from device data.
    MatlabHealth,
}

impl Topic {
    /// All topics, in registry order.
    pub const ALL: [Self; 9] = [
        Self::Esp32Imu,
        Self::Esp32Bio,
        Self::ManualBpm,
        Self::ManualSpo2,
        Self::ManualEstado,
        Self::ManualCaidas,
        Self::MatlabActivity,
        Self::MatlabFall,
        Self::MatlabHealth,
    ];

    /// The logical channel name.
    #[must_use]
    pub const fn logical_name(self) -> &'static str {
        match self {
            Self::Esp32Imu => "ESP32_IMU",
            Self::Esp32Bio => "ESP32_BIO",
            Self::ManualBpm => "MANUAL_BPM",
            Self::ManualSpo2 => "MANUAL_SPO2",
            Self::ManualEstado => "MANUAL_ESTADO",
            Self::ManualCaidas => "MANUAL_CAIDAS",
            Self::MatlabActivity => "MATLAB_ACTIVITY",
            Self::MatlabFall => "MATLAB_FALL",
            Self::MatlabHealth => "MATLAB_HEALTH",
        }
    }

    /// The MQTT topic string.
    #[must_use]
    pub const fn wire(self) -> &'static str {
        match self {
            Self::Esp32Imu => "esp32/imu",
            Self::Esp32Bio => "esp32/bio",
            Self::ManualBpm => "fallmonitor/manual/bpm",
            Self::ManualSpo2 => "fallmonitor/manual/spo2",
            Self::ManualEstado => "fallmonitor/manual/estado",
            Self::ManualCaidas => "fallmonitor/manual/caidas",
            Self::MatlabActivity => "fallmonitor/matlab/activity",
            Self::MatlabFall => "fallmonitor/matlab/fall",
            Self::MatlabHealth => "fallmonitor/esp32/health",
        }
    }

    /// Look up a topic by its exact wire string.
    #[must_use]
    pub fn from_wire(wire: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|topic| topic.wire() == wire)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire())
    }
}

// =============================================================================
// Topic Registry
// =============================================================================

/// Read-only registry of the topics the relay subscribes to.
///
/// Serializes as an ordered JSON object `{logicalName: wireTopic}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicRegistry;

impl TopicRegistry {
    /// The registry used by the relay.
    #[must_use]
    pub const fn standard() -> Self {
        Self
    }

    /// Iterate over registered topics.
    pub fn iter(self) -> impl Iterator<Item = Topic> {
        Topic::ALL.into_iter()
    }

    /// Iterate over wire topic strings.
    pub fn wire_topics(self) -> impl Iterator<Item = &'static str> {
        self.iter().map(Topic::wire)
    }

    /// Number of registered topics.
    #[must_use]
    pub const fn len(self) -> usize {
        Topic::ALL.len()
    }

    /// Always false; the registry is never empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        Topic::ALL.is_empty()
    }

    /// Whether the wire topic belongs to the registry.
    #[must_use]
    pub fn contains(self, wire: &str) -> bool {
        Topic::from_wire(wire).is_some()
    }
}

impl Serialize for TopicRegistry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter().map(|t| (t.logical_name(), t.wire())))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use test_case::test_case;

    use super::*;

    #[test]
    fn wire_topics_are_unique() {
        let wires: HashSet<_> = TopicRegistry::standard().wire_topics().collect();
        assert_eq!(wires.len(), TopicRegistry::standard().len());
    }

    #[test]
    fn logical_names_are_unique() {
        let names: HashSet<_> = Topic::ALL.iter().map(|t| t.logical_name()).collect();
        assert_eq!(names.len(), Topic::ALL.len());
    }

    #[test_case("esp32/imu", Topic::Esp32Imu)]
    #[test_case("esp32/bio", Topic::Esp32Bio)]
    #[test_case("fallmonitor/manual/bpm", Topic::ManualBpm)]
    #[test_case("fallmonitor/manual/spo2", Topic::ManualSpo2)]
    #[test_case("fallmonitor/manual/estado", Topic::ManualEstado)]
    #[test_case("fallmonitor/manual/caidas", Topic::ManualCaidas)]
    #[test_case("fallmonitor/matlab/activity", Topic::MatlabActivity)]
    #[test_case("fallmonitor/matlab/fall", Topic::MatlabFall)]
    #[test_case("fallmonitor/esp32/health", Topic::MatlabHealth)]
    fn from_wire_round_trips(wire: &str, expected: Topic) {
        assert_eq!(Topic::from_wire(wire), Some(expected));
        assert_eq!(expected.wire(), wire);
    }

    #[test]
    fn from_wire_is_exact() {
        assert_eq!(Topic::from_wire("ESP32/IMU"), None);
        assert_eq!(Topic::from_wire("esp32/imu/"), None);
        assert_eq!(Topic::from_wire(""), None);
    }

    #[test]
    fn registry_serializes_in_order() {
        let json = serde_json::to_string(&TopicRegistry::standard()).unwrap();
        assert!(json.starts_with(r#"{"ESP32_IMU":"esp32/imu","ESP32_BIO":"esp32/bio""#));
        assert!(json.ends_with(r#""MATLAB_HEALTH":"fallmonitor/esp32/health"}"#));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 9);
    }

    #[test]
    fn registry_len() {
        let registry = TopicRegistry::standard();
        assert_eq!(registry.len(), 9);
        assert!(!registry.is_empty());
        assert!(registry.contains("fallmonitor/matlab/fall"));
        assert!(!registry.contains("fallmonitor/unknown"));
    }
}
