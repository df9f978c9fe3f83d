//! MQTT Broker Adapter
//!
//! Connects to the telemetry broker, keeps the subscriptions alive across
//! reconnects, and implements the `BrokerPublisher` port.

mod client;
pub mod reconnect;

pub use client::{MqttClientError, MqttEventLoop, MqttHandle, build};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
