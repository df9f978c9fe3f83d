//! Prometheus Metrics Module
//!
//! Exposes relay metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: Broker messages received, dropped, and classified
//! - **Fan-out**: Events broadcast and per-client delivery failures
//! - **Connections**: Broker link state and connected client count
//! - **Latency**: Message processing time from receipt to broadcast
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling this again after a successful install returns the existing handle.
///
/// # Errors
///
/// Returns `BuildError` if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Message counters
    describe_counter!(
        "relay_messages_received_total",
        "Total messages received from the broker by topic"
    );
    describe_counter!(
        "relay_messages_dropped_total",
        "Total broker messages dropped before broadcast"
    );
    describe_counter!(
        "relay_signals_total",
        "Total classified signals by kind"
    );

    // Fan-out counters
    describe_counter!(
        "relay_events_broadcast_total",
        "Total events pushed to clients by channel"
    );
    describe_counter!(
        "relay_client_send_failures_total",
        "Total per-client delivery failures"
    );

    // Connection gauges
    describe_gauge!(
        "relay_clients_connected",
        "Number of connected WebSocket clients"
    );
    describe_gauge!(
        "relay_broker_connected",
        "Broker link state (1 = connected)"
    );

    // Broker counters
    describe_counter!(
        "relay_broker_reconnects_total",
        "Total broker reconnection attempts"
    );
    describe_counter!(
        "relay_broker_publish_total",
        "Total publish requests by outcome"
    );

    // Latency histograms
    describe_histogram!(
        "relay_message_processing_seconds",
        "Time to process a message from receipt to broadcast"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why a broker message never reached clients.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    /// Payload was neither structured data nor a numeral.
    Decode,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
        }
    }
}

/// Why a queued event could not be handed to a client.
#[derive(Debug, Clone, Copy)]
pub enum SendFailure {
    /// The client's queue was full.
    QueueFull,
    /// The client had already gone away.
    Closed,
}

impl SendFailure {
    const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
        }
    }
}

/// Record a message received from the broker.
pub fn record_message_received(topic: &str) {
    counter!(
        "relay_messages_received_total",
        "topic" => topic.to_string()
    )
    .increment(1);
}

/// Record a dropped broker message.
pub fn record_message_dropped(reason: DropReason) {
    counter!(
        "relay_messages_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a classified signal.
pub fn record_signal(kind: &'static str) {
    counter!("relay_signals_total", "kind" => kind).increment(1);
}

/// Record an event pushed to `count` clients.
pub fn record_event_broadcast(event: &'static str, count: u64) {
    counter!("relay_events_broadcast_total", "event" => event).increment(count);
}

/// Record a failed hand-off to a single client.
pub fn record_client_send_failure(reason: SendFailure) {
    counter!(
        "relay_client_send_failures_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Update the connected client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_clients_connected(count: usize) {
    gauge!("relay_clients_connected").set(count as f64);
}

/// Update the broker link state.
pub fn set_broker_connected(connected: bool) {
    gauge!("relay_broker_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a broker reconnection attempt.
pub fn record_reconnect() {
    counter!("relay_broker_reconnects_total").increment(1);
}

/// Record the outcome of a publish request.
pub fn record_publish(success: bool) {
    counter!(
        "relay_broker_publish_total",
        "outcome" => if success { "ok" } else { "error" }
    )
    .increment(1);
}

/// Record message processing duration.
pub fn record_processing_duration(duration: Duration) {
    histogram!("relay_message_processing_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::Decode.as_str(), "decode");
    }

    #[test]
    fn send_failure_as_str() {
        assert_eq!(SendFailure::QueueFull.as_str(), "queue_full");
        assert_eq!(SendFailure::Closed.as_str(), "closed");
    }

    #[test]
    fn recording_without_recorder_is_a_noop() {
        record_message_received("esp32/bio");
        record_message_dropped(DropReason::Decode);
        record_signal("auto_fall");
        record_event_broadcast("mqtt-data", 2);
        record_client_send_failure(SendFailure::QueueFull);
        set_clients_connected(3);
        set_broker_connected(true);
        record_reconnect();
        record_publish(false);
        record_processing_duration(Duration::from_millis(2));
    }
}
