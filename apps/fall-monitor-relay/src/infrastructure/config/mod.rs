//! Configuration Module
//!
//! Configuration loading for the relay service.

mod settings;

pub use settings::{
    BrokerProtocol, ConfigError, MqttSettings, PipelineSettings, RelayConfig, ServerSettings,
};
