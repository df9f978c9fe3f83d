//! Domain Layer - Core telemetry types and pure logic.
//!
//! Nothing in this layer performs I/O. Broker payloads come in as bytes and
//! leave as canonical events and classification signals.

/// Fixed mapping between logical channel names and MQTT topics.
pub mod topics;

/// Broker connection status shared between the broker adapter and readers.
pub mod connection;

/// Payload normalization into canonical telemetry events.
pub mod telemetry;

/// Detection of manual controls and fall alerts.
pub mod classification;
