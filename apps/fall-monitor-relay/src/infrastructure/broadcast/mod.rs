//! Client Session Hub
//!
//! Owns the set of connected client sessions and fans events out to them.
//!
//! # Architecture
//!
//! Each session gets its own bounded queue of pre-serialized frames. An event
//! is encoded once and the shared frame is offered to every queue with
//! `try_send`, so a slow or vanished client never stalls the pipeline or the
//! other clients:
//!
//! - full queue: the frame is dropped for that client only
//! - closed queue: the session is pruned from the registry
//!
//! The first frame in every new queue is the broker status snapshot taken at
//! registration time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::application::ports::EventSink;
use crate::domain::connection::SharedConnectionStatus;
use crate::domain::telemetry::{EmergencyAlert, NormalizedEvent};
use crate::domain::topics::TopicRegistry;
use crate::infrastructure::config::PipelineSettings;
use crate::infrastructure::metrics::{self, SendFailure};

// =============================================================================
// Client Events
// =============================================================================

/// Broker status sent once to each new client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Whether the broker link was up at registration time.
    pub connected: bool,
    /// Number of subscribed topics.
    pub topics: usize,
}

/// Frame pushed to clients, serialized as `{"event": <channel>, "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Normalized broker telemetry.
    MqttData(NormalizedEvent),
    /// Broker status snapshot.
    MqttStatus(StatusSnapshot),
    /// Operator-injected emergency alert.
    EmergencyAlert(EmergencyAlert),
}

impl ClientEvent {
    /// Channel name as seen by clients.
    #[must_use]
    pub const fn channel(&self) -> &'static str {
        match self {
            Self::MqttData(_) => "mqtt-data",
            Self::MqttStatus(_) => "mqtt-status",
            Self::EmergencyAlert(_) => "emergency-alert",
        }
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// Opaque client session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A registered client: its id and the receiving end of its frame queue.
#[derive(Debug)]
pub struct ClientSession {
    /// Session identifier, used to deregister.
    pub id: SessionId,
    /// Serialized frames destined for this client.
    pub frames: mpsc::Receiver<Arc<str>>,
}

// =============================================================================
// Broadcast Hub
// =============================================================================

/// Hub configuration.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    /// Capacity of each client's frame queue.
    pub client_queue_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: 256,
        }
    }
}

impl From<&PipelineSettings> for BroadcastConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            client_queue_capacity: settings.client_queue_capacity,
        }
    }
}

/// Registry of connected sessions with non-blocking fan-out.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use fall_monitor_relay::domain::connection::ConnectionStatus;
/// use fall_monitor_relay::domain::topics::TopicRegistry;
/// use fall_monitor_relay::infrastructure::broadcast::{BroadcastConfig, BroadcastHub};
///
/// let hub = BroadcastHub::new(
///     BroadcastConfig::default(),
///     Arc::new(ConnectionStatus::new()),
///     TopicRegistry::standard(),
/// );
///
/// let mut session = hub.register();
/// let snapshot = session.frames.try_recv().unwrap();
/// assert!(snapshot.contains("mqtt-status"));
///
/// hub.disconnect(session.id);
/// assert_eq!(hub.session_count(), 0);
/// ```
#[derive(Debug)]
pub struct BroadcastHub {
    sessions: RwLock<HashMap<SessionId, mpsc::Sender<Arc<str>>>>,
    status: SharedConnectionStatus,
    registry: TopicRegistry,
    config: BroadcastConfig,
}

impl BroadcastHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new(config: BroadcastConfig, status: SharedConnectionStatus, registry: TopicRegistry) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            status,
            registry,
            config: BroadcastConfig {
                client_queue_capacity: config.client_queue_capacity.max(1),
            },
        }
    }

    /// Register a new session.
    ///
    /// The returned queue already holds the status snapshot, so it is always
    /// the first frame the client sees.
    #[must_use]
    pub fn register(&self) -> ClientSession {
        let id = SessionId::new();
        let (tx, frames) = mpsc::channel(self.config.client_queue_capacity);

        let snapshot = ClientEvent::MqttStatus(self.snapshot());
        if let Some(frame) = encode(&snapshot)
            && tx.try_send(frame).is_ok()
        {
            metrics::record_event_broadcast(snapshot.channel(), 1);
        }

        let count = {
            let mut sessions = self.sessions.write();
            sessions.insert(id, tx);
            sessions.len()
        };
        metrics::set_clients_connected(count);
        tracing::info!(session_id = %id, clients = count, "Client connected");

        ClientSession { id, frames }
    }

    /// Deregister a session. Returns false if it was already gone.
    pub fn disconnect(&self, id: SessionId) -> bool {
        let (removed, count) = {
            let mut sessions = self.sessions.write();
            (sessions.remove(&id).is_some(), sessions.len())
        };
        if removed {
            metrics::set_clients_connected(count);
            tracing::info!(session_id = %id, clients = count, "Client disconnected");
        }
        removed
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Current broker status as reported to new clients.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            connected: self.status.is_connected(),
            topics: self.registry.len(),
        }
    }

    /// Offer an event to every session. Returns how many accepted it.
    pub fn send(&self, event: &ClientEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, tx) in sessions.iter() {
                match tx.try_send(Arc::clone(&frame)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        metrics::record_client_send_failure(SendFailure::QueueFull);
                        tracing::warn!(session_id = %id, event = event.channel(), "Client queue full, dropping frame");
                    }
                    Err(TrySendError::Closed(_)) => {
                        metrics::record_client_send_failure(SendFailure::Closed);
                        closed.push(*id);
                    }
                }
            }
        }

        for id in closed {
            self.disconnect(id);
        }

        metrics::record_event_broadcast(event.channel(), u64::try_from(delivered).unwrap_or(u64::MAX));
        delivered
    }
}

impl EventSink for BroadcastHub {
    fn broadcast(&self, event: &NormalizedEvent) -> usize {
        self.send(&ClientEvent::MqttData(event.clone()))
    }

    fn broadcast_alert(&self, alert: &EmergencyAlert) -> usize {
        let recipients = self.send(&ClientEvent::EmergencyAlert(alert.clone()));
        tracing::warn!(
            contact = %alert.contact,
            message = %alert.message,
            recipients,
            "Emergency alert broadcast"
        );
        recipients
    }
}

/// Shared broadcast hub reference.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

fn encode(event: &ClientEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            tracing::warn!(event = event.channel(), error = %e, "Failed to serialize client event");
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};

    use super::*;
    use crate::domain::connection::ConnectionStatus;

    fn hub_with(capacity: usize) -> (BroadcastHub, SharedConnectionStatus) {
        let status = Arc::new(ConnectionStatus::new());
        let hub = BroadcastHub::new(
            BroadcastConfig {
                client_queue_capacity: capacity,
            },
            Arc::clone(&status),
            TopicRegistry::standard(),
        );
        (hub, status)
    }

    fn event() -> NormalizedEvent {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        NormalizedEvent::new("fallmonitor/manual/bpm", json!({"bpm": 72}), at)
    }

    fn next_json(session: &mut ClientSession) -> Value {
        let frame = session.frames.try_recv().unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[test]
    fn envelope_uses_channel_names() {
        let frame = serde_json::to_value(ClientEvent::MqttData(event())).unwrap();
        assert_eq!(
            frame,
            json!({
                "event": "mqtt-data",
                "data": {
                    "topic": "fallmonitor/manual/bpm",
                    "data": {"bpm": 72},
                    "timestamp": "2024-05-01T12:00:00.000Z"
                }
            })
        );

        let status = ClientEvent::MqttStatus(StatusSnapshot {
            connected: true,
            topics: 9,
        });
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"event": "mqtt-status", "data": {"connected": true, "topics": 9}})
        );
        assert_eq!(status.channel(), "mqtt-status");
    }

    #[test]
    fn new_session_receives_exactly_one_snapshot() {
        let (hub, status) = hub_with(8);
        status.mark_connected();

        let mut session = hub.register();

        assert_eq!(
            next_json(&mut session),
            json!({"event": "mqtt-status", "data": {"connected": true, "topics": 9}})
        );
        assert!(session.frames.try_recv().is_err());
    }

    #[test]
    fn snapshot_reflects_status_at_connect_time() {
        let (hub, status) = hub_with(8);

        let mut early = hub.register();
        status.mark_connected();
        let mut late = hub.register();

        assert_eq!(next_json(&mut early)["data"]["connected"], json!(false));
        assert_eq!(next_json(&mut late)["data"]["connected"], json!(true));
        // Status changes are not re-pushed.
        assert!(early.frames.try_recv().is_err());
    }

    #[test]
    fn broadcast_reaches_every_session() {
        let (hub, _status) = hub_with(8);
        let mut sessions: Vec<_> = (0..3).map(|_| hub.register()).collect();
        for session in &mut sessions {
            let _ = next_json(session);
        }

        assert_eq!(hub.broadcast(&event()), 3);

        for session in &mut sessions {
            let frame = next_json(session);
            assert_eq!(frame["event"], "mqtt-data");
            assert_eq!(frame["data"]["data"], json!({"bpm": 72}));
        }
    }

    #[test]
    fn failed_recipient_does_not_block_others() {
        let (hub, _status) = hub_with(8);
        let mut a = hub.register();
        let gone = hub.register();
        let mut c = hub.register();
        drop(gone.frames);

        assert_eq!(hub.broadcast(&event()), 2);

        let _ = next_json(&mut a);
        let _ = next_json(&mut c);
        assert_eq!(next_json(&mut a)["event"], "mqtt-data");
        assert_eq!(next_json(&mut c)["event"], "mqtt-data");
        assert_eq!(hub.session_count(), 2);
    }

    #[test]
    fn full_queue_drops_frame_but_keeps_session() {
        let (hub, _status) = hub_with(1);
        let mut stalled = hub.register();

        assert_eq!(hub.broadcast(&event()), 0);
        assert_eq!(hub.session_count(), 1);

        assert_eq!(next_json(&mut stalled)["event"], "mqtt-status");
        assert_eq!(hub.broadcast(&event()), 1);
    }

    #[test]
    fn alert_uses_its_own_channel() {
        let (hub, _status) = hub_with(8);
        let mut session = hub.register();
        let _ = next_json(&mut session);
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let recipients = hub.broadcast_alert(&EmergencyAlert::new("Dr. Ruiz", "Fall in room 4", at));

        assert_eq!(recipients, 1);
        assert_eq!(
            next_json(&mut session),
            json!({
                "event": "emergency-alert",
                "data": {
                    "contact": "Dr. Ruiz",
                    "message": "Fall in room 4",
                    "timestamp": "2024-05-01T12:00:00.000Z"
                }
            })
        );
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (hub, _status) = hub_with(8);
        let session = hub.register();
        assert_eq!(hub.session_count(), 1);

        assert!(hub.disconnect(session.id));
        assert!(!hub.disconnect(session.id));
        assert_eq!(hub.session_count(), 0);
    }

    #[test]
    fn broadcast_without_sessions_is_a_noop() {
        let (hub, _status) = hub_with(8);
        assert_eq!(hub.broadcast(&event()), 0);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let (hub, _status) = hub_with(0);
        let mut session = hub.register();
        assert_eq!(next_json(&mut session)["event"], "mqtt-status");
    }
}
