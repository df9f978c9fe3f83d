//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.
//! Every setting is optional; unparseable numbers fall back to the default.

use std::time::Duration;

/// Transport used to reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerProtocol {
    /// Plain TCP.
    #[default]
    Mqtt,
    /// TLS over TCP.
    Mqtts,
}

impl BrokerProtocol {
    /// Parse a protocol name. Returns `None` for unsupported schemes.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mqtt" | "tcp" => Some(Self::Mqtt),
            "mqtts" | "ssl" | "tls" => Some(Self::Mqtts),
            _ => None,
        }
    }

    /// Canonical scheme name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Mqtts => "mqtts",
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Broker hostname.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Transport protocol.
    pub protocol: BrokerProtocol,
    /// MQTT client identifier.
    pub client_id: String,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Capacity of the outbound request queue (subscribes and publishes).
    pub request_capacity: usize,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            protocol: BrokerProtocol::Mqtt,
            client_id: generate_client_id(),
            keep_alive: Duration::from_secs(60),
            request_capacity: 64,
            reconnect_delay_initial: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
        }
    }
}

/// Fan-out buffer sizes.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Capacity of each client's outbound queue.
    pub client_queue_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            client_queue_capacity: 256,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Port for the HTTP control API and WebSocket endpoint.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: 3001 }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// HTTP server settings.
    pub server: ServerSettings,
    /// Broker settings.
    pub mqtt: MqttSettings,
    /// Buffer sizes.
    pub pipeline: PipelineSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `MQTT_HOST` is set but empty, or `MQTT_PROTOCOL`
    /// names an unsupported transport.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`RelayConfig::from_env`].
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = ServerSettings {
            port: parse_or(&lookup, "PORT", ServerSettings::default().port),
        };

        let mqtt_defaults = MqttSettings::default();

        let host = match lookup("MQTT_HOST") {
            Some(host) if host.trim().is_empty() => {
                return Err(ConfigError::EmptyValue("MQTT_HOST".to_string()));
            }
            Some(host) => host.trim().to_string(),
            None => mqtt_defaults.host,
        };

        let protocol = match lookup("MQTT_PROTOCOL") {
            Some(raw) => BrokerProtocol::from_str_case_insensitive(&raw).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "MQTT_PROTOCOL".to_string(),
                    value: raw,
                }
            })?,
            None => mqtt_defaults.protocol,
        };

        let client_id = lookup("MQTT_CLIENT_ID")
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or(mqtt_defaults.client_id);

        let mqtt = MqttSettings {
            host,
            port: parse_or(&lookup, "MQTT_PORT", mqtt_defaults.port),
            protocol,
            client_id,
            keep_alive: lookup("MQTT_KEEP_ALIVE_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(mqtt_defaults.keep_alive, Duration::from_secs),
            request_capacity: parse_or(
                &lookup,
                "MQTT_REQUEST_CAPACITY",
                mqtt_defaults.request_capacity,
            ),
            reconnect_delay_initial: lookup("RELAY_RECONNECT_DELAY_INITIAL_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(mqtt_defaults.reconnect_delay_initial, Duration::from_millis),
            reconnect_delay_max: lookup("RELAY_RECONNECT_DELAY_MAX_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(mqtt_defaults.reconnect_delay_max, Duration::from_secs),
            reconnect_delay_multiplier: parse_or(
                &lookup,
                "RELAY_RECONNECT_DELAY_MULTIPLIER",
                mqtt_defaults.reconnect_delay_multiplier,
            ),
        };

        let pipeline = PipelineSettings {
            client_queue_capacity: parse_or(
                &lookup,
                "RELAY_CLIENT_QUEUE_CAPACITY",
                PipelineSettings::default().client_queue_capacity,
            )
            .max(1),
        };

        Ok(Self {
            server,
            mqtt,
            pipeline,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unsupported value.
    #[error("environment variable {key} has unsupported value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Rejected value.
        value: String,
    },
}

fn generate_client_id() -> String {
    format!("fall-monitor-relay-{}", uuid::Uuid::new_v4().simple())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
