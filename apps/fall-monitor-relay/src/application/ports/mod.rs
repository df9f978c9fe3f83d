//! Port Interfaces
//!
//! Contracts between the application layer and its adapters.
//!
//! ## Driven Ports (Outbound)
//!
//! - `BrokerPublisher`: publish a payload to the MQTT broker
//! - `EventSink`: fan events out to every connected client

use async_trait::async_trait;

use crate::domain::telemetry::{EmergencyAlert, NormalizedEvent};

/// Errors surfaced by a broker publish.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker client rejected or could not queue the publish.
    #[error("{0}")]
    PublishFailed(String),
}

/// Outbound publishing to the message broker.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publish `payload` on `topic`.
    ///
    /// Delivery is fire-and-forget: `Ok` means the broker client accepted the
    /// message for sending.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError` if the client cannot accept the publish.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// Fan-out of events to connected clients.
///
/// Implementations must not block on any single client.
pub trait EventSink: Send + Sync {
    /// Push a telemetry event to every client. Returns the number of clients
    /// the event was queued for.
    fn broadcast(&self, event: &NormalizedEvent) -> usize;

    /// Push an emergency alert to every client. Returns the number of clients
    /// the alert was queued for.
    fn broadcast_alert(&self, alert: &EmergencyAlert) -> usize;
}
