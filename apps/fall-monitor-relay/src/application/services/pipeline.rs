//! Telemetry Ingestion Pipeline
//!
//! Consumes raw broker messages from a channel, one at a time, in delivery
//! order. Each message is normalized, classified, logged, and handed to the
//! event sink. A malformed message is dropped with a diagnostic and never
//! affects the next one.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::EventSink;
use crate::domain::classification::{ClassifiedSignal, classify};
use crate::domain::telemetry::{NormalizedEvent, RawMessage, normalize};
use crate::domain::topics::Topic;
use crate::infrastructure::metrics;

/// Characters of an undecodable body included in the drop diagnostic.
const PREVIEW_CHARS: usize = 120;

/// What happened to a single message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The body could not be decoded; nothing was broadcast.
    Dropped,
    /// The event was broadcast.
    Delivered {
        /// The broadcast event.
        event: NormalizedEvent,
        /// Classification, if any rule matched.
        signal: Option<ClassifiedSignal>,
        /// Number of clients the event was queued for.
        recipients: usize,
    },
}

/// Normalize → classify → broadcast.
pub struct TelemetryPipeline<S: EventSink> {
    sink: Arc<S>,
}

impl<S: EventSink> TelemetryPipeline<S> {
    /// Create a pipeline that broadcasts into `sink`.
    #[must_use]
    pub const fn new(sink: Arc<S>) -> Self {
        Self { sink }
    }

    /// Process messages until the channel closes or `cancel` fires.
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<RawMessage>,
        cancel: CancellationToken,
    ) {
        tracing::info!("Telemetry pipeline started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Telemetry pipeline cancelled");
                    break;
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        tracing::info!("Ingest channel closed");
                        break;
                    };
                    let _ = self.process(msg);
                }
            }
        }
    }

    /// Handle one broker message.
    pub fn process(&self, message: RawMessage) -> ProcessOutcome {
        let started = Instant::now();
        metrics::record_message_received(&message.topic);

        let Some(data) = normalize(&message.body) else {
            tracing::warn!(
                topic = %message.topic,
                bytes = message.body.len(),
                body = %message.preview(PREVIEW_CHARS),
                "Dropping undecodable message"
            );
            metrics::record_message_dropped(metrics::DropReason::Decode);
            return ProcessOutcome::Dropped;
        };

        let RawMessage { topic, .. } = message;
        log_event(&topic, &data);

        let signal = classify(&topic, &data);
        if let Some(signal) = &signal {
            report_signal(&topic, signal);
        }

        let event = NormalizedEvent::new(topic, data, Utc::now());
        let recipients = self.sink.broadcast(&event);
        metrics::record_processing_duration(started.elapsed());

        ProcessOutcome::Delivered {
            event,
            signal,
            recipients,
        }
    }
}

/// IMU traffic is high-rate, so it only shows up at debug level.
fn log_event(topic: &str, data: &serde_json::Value) {
    if Topic::from_wire(topic) == Some(Topic::Esp32Imu) {
        tracing::debug!(topic, %data, "Telemetry received");
    } else {
        tracing::info!(topic, %data, "Telemetry received");
    }
}

fn report_signal(topic: &str, signal: &ClassifiedSignal) {
    metrics::record_signal(signal.kind());
    match signal {
        ClassifiedSignal::ManualStateChange { state } => {
            tracing::info!(topic, state = %state, "Manual state control");
        }
        ClassifiedSignal::ManualFallFlag { triggered: true } => {
            tracing::warn!(topic, "Manual fall registered");
        }
        ClassifiedSignal::ManualFallFlag { triggered: false } => {
            tracing::debug!(topic, "Manual fall control without trigger");
        }
        ClassifiedSignal::AutoFallAlert { count, timestamp } => {
            tracing::warn!(
                topic,
                fall_count = ?count,
                detected_at = ?timestamp,
                "Fall detected"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
