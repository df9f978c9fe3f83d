//! Broker Client
//!
//! Wraps `rumqttc` into two halves:
//!
//! - [`MqttHandle`]: cheap, cloneable publisher used by the HTTP layer.
//! - [`MqttEventLoop`]: owns the connection. It drives the protocol, keeps
//!   the shared link status current, re-subscribes to every registry topic on
//!   each successful connect, and forwards inbound publishes to the ingest
//!   channel.
//!
//! Neither half ever blocks. Inbound messages go to an unbounded ingest
//! channel, so none is lost before normalization. Publishes that do not fit
//! in the request queue fail fast. Subscribes that do not fit are deferred
//! and retried as the event loop drains the queue.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{BrokerError, BrokerPublisher};
use crate::domain::connection::SharedConnectionStatus;
use crate::domain::telemetry::RawMessage;
use crate::domain::topics::TopicRegistry;
use crate::infrastructure::config::{BrokerProtocol, MqttSettings};
use crate::infrastructure::metrics;

/// How long shutdown waits for the DISCONNECT packet to go out.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Errors raised while building the broker client.
#[derive(Debug, thiserror::Error)]
pub enum MqttClientError {
    /// The client identifier is empty or starts with whitespace.
    #[error("invalid MQTT client id {0:?}")]
    InvalidClientId(String),
    /// The request queue cannot hold one subscribe per topic.
    #[error("request capacity {capacity} is below the {required} topic subscriptions")]
    RequestCapacityTooSmall {
        /// Configured capacity.
        capacity: usize,
        /// Number of subscriptions issued per connect.
        required: usize,
    },
}

/// Build the broker client.
///
/// Nothing touches the network until [`MqttEventLoop::run`] is polled.
///
/// # Errors
///
/// Returns `MqttClientError` if the settings cannot produce a usable client.
pub fn build(
    settings: &MqttSettings,
    registry: TopicRegistry,
    status: SharedConnectionStatus,
    ingest: mpsc::UnboundedSender<RawMessage>,
    cancel: CancellationToken,
) -> Result<(MqttHandle, MqttEventLoop), MqttClientError> {
    if settings.client_id.is_empty() || settings.client_id.starts_with(char::is_whitespace) {
        return Err(MqttClientError::InvalidClientId(settings.client_id.clone()));
    }
    if settings.request_capacity < registry.len() {
        return Err(MqttClientError::RequestCapacityTooSmall {
            capacity: settings.request_capacity,
            required: registry.len(),
        });
    }

    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);
    match settings.protocol {
        BrokerProtocol::Mqtt => {
            options.set_transport(Transport::Tcp);
        }
        BrokerProtocol::Mqtts => {
            options.set_transport(Transport::tls_with_default_config());
        }
    }

    let (client, event_loop) = AsyncClient::new(options, settings.request_capacity);

    tracing::info!(
        host = %settings.host,
        port = settings.port,
        protocol = settings.protocol.as_str(),
        client_id = %settings.client_id,
        "MQTT client configured"
    );

    let handle = MqttHandle {
        client: client.clone(),
    };
    let driver = MqttEventLoop {
        event_loop,
        client,
        registry,
        status,
        ingest,
        policy: ReconnectPolicy::new(ReconnectConfig::from_mqtt_settings(settings)),
        deferred_subscriptions: VecDeque::with_capacity(registry.len()),
        queued_subscriptions: VecDeque::with_capacity(registry.len()),
        sent_subscriptions: HashMap::with_capacity(registry.len()),
        cancel,
    };
    Ok((handle, driver))
}

// =============================================================================
// Publisher Handle
// =============================================================================

/// Cloneable publisher half of the broker client.
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
}

#[async_trait]
impl BrokerPublisher for MqttHandle {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let result = self
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| BrokerError::PublishFailed(e.to_string()));

        metrics::record_publish(result.is_ok());
        match &result {
            Ok(()) => tracing::info!(topic, "Publish queued"),
            Err(e) => tracing::warn!(topic, error = %e, "Publish rejected"),
        }
        result
    }
}

// =============================================================================
// Event Loop Driver
// =============================================================================

/// Connection-owning half of the broker client.
pub struct MqttEventLoop {
    event_loop: EventLoop,
    client: AsyncClient,
    registry: TopicRegistry,
    status: SharedConnectionStatus,
    ingest: mpsc::UnboundedSender<RawMessage>,
    policy: ReconnectPolicy,
    /// Topics still to be handed to the client once its request queue has room.
    deferred_subscriptions: VecDeque<&'static str>,
    /// Topics handed to the client, not yet assigned a packet id, in request
    /// queue order. Kept across reconnects: those requests are still queued
    /// and go out on the next connection.
    queued_subscriptions: VecDeque<&'static str>,
    /// Packet id to topic for subscriptions awaiting SUBACK.
    sent_subscriptions: HashMap<u16, &'static str>,
    cancel: CancellationToken,
}

impl MqttEventLoop {
    /// Drive the connection until cancelled.
    ///
    /// Connection failures are retried forever with backoff.
    pub async fn run(mut self) {
        tracing::info!("MQTT event loop started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                event = self.event_loop.poll() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(e) => {
                        self.handle_link_down(&e.to_string());
                        let delay = self.policy.next_delay();
                        metrics::record_reconnect();
                        tracing::warn!(
                            error = %e,
                            attempt = self.policy.attempt_count(),
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "MQTT connection error, reconnecting"
                        );
                        tokio::select! {
                            () = self.cancel.cancelled() => {
                                self.shutdown().await;
                                break;
                            }
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }

        tracing::info!("MQTT event loop stopped");
    }

    /// React to one protocol event.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    self.handle_link_up();
                } else {
                    tracing::error!(code = ?ack.code, "MQTT connection refused by broker");
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                self.forward(RawMessage::new(publish.topic, publish.payload));
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let topic = self.sent_subscriptions.remove(&ack.pkid).unwrap_or("unknown");
                for code in &ack.return_codes {
                    match code {
                        SubscribeReasonCode::Success(qos) => {
                            tracing::debug!(topic, ?qos, "Subscription acknowledged");
                        }
                        SubscribeReasonCode::Failure => {
                            tracing::error!(topic, pkid = ack.pkid, "Broker refused subscription");
                        }
                    }
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                self.handle_link_down("disconnected by broker");
            }
            Event::Incoming(_) => {}
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                if let Some(topic) = self.queued_subscriptions.pop_front() {
                    self.sent_subscriptions.insert(pkid, topic);
                }
            }
            Event::Outgoing(outgoing) => {
                tracing::trace!(?outgoing, "Outgoing packet");
            }
        }

        if !self.deferred_subscriptions.is_empty() && self.status.is_connected() {
            self.subscribe_deferred();
        }
    }

    fn handle_link_up(&mut self) {
        let was_connected = self.status.mark_connected();
        metrics::set_broker_connected(true);
        self.policy.reset();
        if !was_connected {
            tracing::info!("Connected to MQTT broker");
        }

        // Requests sent on the previous connection will never be acknowledged.
        self.sent_subscriptions.clear();
        self.deferred_subscriptions = self
            .registry
            .wire_topics()
            .filter(|topic| !self.queued_subscriptions.contains(topic))
            .collect();
        self.subscribe_deferred();

        if !self.deferred_subscriptions.is_empty() {
            tracing::warn!(
                deferred = self.deferred_subscriptions.len(),
                "MQTT request queue full, deferring subscriptions"
            );
        }
    }

    /// Hand deferred topics to the client until its request queue is full.
    fn subscribe_deferred(&mut self) {
        while let Some(&topic) = self.deferred_subscriptions.front() {
            match self.client.try_subscribe(topic, QoS::AtMostOnce) {
                Ok(()) => {
                    self.deferred_subscriptions.pop_front();
                    self.queued_subscriptions.push_back(topic);
                    tracing::info!(topic, "Subscribing");
                }
                // Only a full queue fails here; this loop owns the receiving end.
                Err(e) => {
                    tracing::debug!(topic, error = %e, "Subscribe deferred");
                    break;
                }
            }
        }
    }

    fn handle_link_down(&self, reason: &str) {
        let was_connected = self.status.mark_disconnected();
        metrics::set_broker_connected(false);
        if was_connected {
            tracing::warn!(reason, "MQTT broker connection lost");
        }
    }

    fn forward(&self, message: RawMessage) {
        if let Err(mpsc::error::SendError(message)) = self.ingest.send(message) {
            tracing::debug!(topic = %message.topic, "Ingest closed, dropping message");
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("Disconnecting from MQTT broker");
        self.status.mark_disconnected();
        metrics::set_broker_connected(false);

        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!(error = %e, "Disconnect request not queued");
            return;
        }

        let flush = async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
            tracing::debug!("Timed out flushing DISCONNECT");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use rumqttc::{ConnAck, Publish, SubAck};

    use super::*;
    use crate::domain::connection::ConnectionStatus;

    fn settings() -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            client_id: "relay-test".to_string(),
            ..MqttSettings::default()
        }
    }

    fn driver() -> (MqttEventLoop, mpsc::UnboundedReceiver<RawMessage>, SharedConnectionStatus) {
        let (_handle, driver, rx, status) = client(&settings());
        (driver, rx, status)
    }

    fn client(
        settings: &MqttSettings,
    ) -> (
        MqttHandle,
        MqttEventLoop,
        mpsc::UnboundedReceiver<RawMessage>,
        SharedConnectionStatus,
    ) {
        let status = Arc::new(ConnectionStatus::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, driver) = build(
            settings,
            TopicRegistry::standard(),
            Arc::clone(&status),
            tx,
            CancellationToken::new(),
        )
        .unwrap();
        (handle, driver, rx, status)
    }

    fn connack() -> Event {
        Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)))
    }

    fn publish(topic: &str, body: &'static str) -> Event {
        Event::Incoming(Packet::Publish(Publish::new(
            topic,
            QoS::AtMostOnce,
            body.as_bytes().to_vec(),
        )))
    }

    #[test]
    fn rejects_blank_client_id() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = build(
            &MqttSettings {
                client_id: String::new(),
                ..settings()
            },
            TopicRegistry::standard(),
            Arc::new(ConnectionStatus::new()),
            tx,
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(MqttClientError::InvalidClientId(_))));
    }

    #[test]
    fn rejects_request_capacity_below_topic_count() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = build(
            &MqttSettings {
                request_capacity: 2,
                ..settings()
            },
            TopicRegistry::standard(),
            Arc::new(ConnectionStatus::new()),
            tx,
            CancellationToken::new(),
        );
        assert!(matches!(
            result,
            Err(MqttClientError::RequestCapacityTooSmall { capacity: 2, required: 9 })
        ));
    }

    #[tokio::test]
    async fn connack_marks_connected() {
        let (mut driver, _rx, status) = driver();
        assert!(!status.is_connected());

        driver.handle_event(connack());

        assert!(status.is_connected());
    }

    #[tokio::test]
    async fn refused_connack_stays_disconnected() {
        let (mut driver, _rx, status) = driver();

        driver.handle_event(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false,
        ))));

        assert!(!status.is_connected());
    }

    #[tokio::test]
    async fn broker_disconnect_marks_disconnected() {
        let (mut driver, _rx, status) = driver();
        driver.handle_event(connack());

        driver.handle_event(Event::Incoming(Packet::Disconnect));

        assert!(!status.is_connected());
    }

    #[tokio::test]
    async fn publish_is_forwarded_in_order() {
        let (mut driver, mut rx, _status) = driver();

        driver.handle_event(publish("esp32/bio", r#"{"bpm":70}"#));
        driver.handle_event(publish("esp32/imu", "[1,2,3]"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first, RawMessage::new("esp32/bio", r#"{"bpm":70}"#));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.topic, "esp32/imu");
    }

    #[tokio::test]
    async fn burst_reaches_ingest_without_loss() {
        let (mut driver, mut rx, _status) = driver();
        let bodies: Vec<String> = (0..64)
            .map(|seq| format!(r#"{{"value":1,"seq":{seq}}}"#))
            .collect();

        for body in &bodies {
            driver.handle_event(Event::Incoming(Packet::Publish(Publish::new(
                "fallmonitor/manual/caidas",
                QoS::AtMostOnce,
                body.as_bytes().to_vec(),
            ))));
        }

        for body in &bodies {
            let message = rx.try_recv().unwrap();
            assert_eq!(message.topic, "fallmonitor/manual/caidas");
            assert_eq!(message.body, Bytes::copy_from_slice(body.as_bytes()));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn connack_queues_one_subscribe_per_topic() {
        let (mut driver, _rx, _status) = driver();

        driver.handle_event(connack());

        let queued: Vec<_> = driver.queued_subscriptions.iter().copied().collect();
        let expected: Vec<_> = TopicRegistry::standard().wire_topics().collect();
        assert_eq!(queued, expected);
    }

    #[tokio::test]
    async fn suback_failure_is_tolerated() {
        let (mut driver, _rx, status) = driver();
        driver.handle_event(connack());
        driver.handle_event(Event::Outgoing(Outgoing::Subscribe(7)));
        assert_eq!(driver.sent_subscriptions.get(&7), Some(&"esp32/imu"));

        driver.handle_event(Event::Incoming(Packet::SubAck(SubAck::new(
            7,
            vec![SubscribeReasonCode::Failure],
        ))));

        assert!(status.is_connected());
        assert!(driver.sent_subscriptions.is_empty());
        assert_eq!(driver.queued_subscriptions.len(), 8);
    }

    #[tokio::test]
    async fn reconnect_keeps_queued_subscriptions_aligned() {
        let (mut driver, _rx, _status) = driver();
        driver.handle_event(connack());
        driver.handle_event(Event::Outgoing(Outgoing::Subscribe(1)));

        driver.handle_event(Event::Incoming(Packet::Disconnect));
        driver.handle_event(connack());

        // Only the topic whose request already went out is requested again;
        // the other eight are still queued from the first connection.
        assert!(driver.sent_subscriptions.is_empty());
        let mut expected: Vec<_> = TopicRegistry::standard().wire_topics().skip(1).collect();
        expected.push("esp32/imu");
        let queued: Vec<_> = driver.queued_subscriptions.iter().copied().collect();
        assert_eq!(queued, expected);

        // The stale request for esp32/bio goes out first on the new link.
        driver.handle_event(Event::Outgoing(Outgoing::Subscribe(2)));
        driver.handle_event(Event::Incoming(Packet::SubAck(SubAck::new(
            2,
            vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
        ))));
        assert_eq!(driver.queued_subscriptions.front(), Some(&"fallmonitor/manual/bpm"));
        assert!(driver.sent_subscriptions.is_empty());
    }

    #[tokio::test]
    async fn reconnect_requests_each_topic_once() {
        let (mut driver, _rx, _status) = driver();
        driver.handle_event(connack());
        driver.handle_event(Event::Incoming(Packet::Disconnect));
        driver.handle_event(connack());

        let queued: Vec<_> = driver.queued_subscriptions.iter().copied().collect();
        let expected: Vec<_> = TopicRegistry::standard().wire_topics().collect();
        assert_eq!(queued, expected);
        assert!(driver.deferred_subscriptions.is_empty());
    }

    #[tokio::test]
    async fn full_request_queue_defers_subscriptions() {
        let (handle, mut driver, _rx, status) = client(&MqttSettings {
            request_capacity: 9,
            ..settings()
        });
        for seq in 0..9 {
            handle
                .publish("fallmonitor/manual/bpm", format!("{seq}").into_bytes())
                .await
                .unwrap();
        }

        driver.handle_event(connack());

        assert!(status.is_connected());
        assert!(driver.queued_subscriptions.is_empty());
        assert_eq!(driver.deferred_subscriptions.len(), 9);

        // Still full: another event retries and leaves the topics deferred.
        driver.handle_event(Event::Outgoing(Outgoing::PingReq));
        assert_eq!(driver.deferred_subscriptions.len(), 9);
    }

    /// Accept one client, answer CONNECT with a successful CONNACK, then read
    /// and discard everything the client sends.
    async fn accepting_broker(listener: tokio::net::TcpListener) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0_u8; 4096];
        let _ = socket.read(&mut buf).await.unwrap();
        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        while socket.read(&mut buf).await.is_ok_and(|n| n > 0) {}
    }

    #[tokio::test]
    async fn deferred_subscriptions_go_out_once_publishes_drain() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(accepting_broker(listener));

        let (handle, mut driver, _rx, status) = client(&MqttSettings {
            port,
            request_capacity: 9,
            ..settings()
        });
        for seq in 0..9 {
            handle
                .publish("fallmonitor/manual/bpm", format!("{seq}").into_bytes())
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while driver.sent_subscriptions.len() < 9 {
                let event = driver.event_loop.poll().await.unwrap();
                driver.handle_event(event);
            }
        })
        .await
        .unwrap();

        assert!(status.is_connected());
        assert!(driver.deferred_subscriptions.is_empty());
        assert!(driver.queued_subscriptions.is_empty());
        let mut sent: Vec<_> = driver.sent_subscriptions.values().copied().collect();
        let mut expected: Vec<_> = TopicRegistry::standard().wire_topics().collect();
        sent.sort_unstable();
        expected.sort_unstable();
        assert_eq!(sent, expected);
    }

    #[tokio::test]
    async fn publish_handle_queues_without_connection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, _driver) = build(
            &settings(),
            TopicRegistry::standard(),
            Arc::new(ConnectionStatus::new()),
            tx,
            CancellationToken::new(),
        )
        .unwrap();

        let result = handle.publish("fallmonitor/manual/bpm", b"{\"bpm\":80}".to_vec()).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn publish_handle_fails_when_driver_is_gone() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, driver) = build(
            &settings(),
            TopicRegistry::standard(),
            Arc::new(ConnectionStatus::new()),
            tx,
            CancellationToken::new(),
        )
        .unwrap();
        drop(driver);

        let result = handle.publish("fallmonitor/manual/bpm", b"1".to_vec()).await;

        assert!(matches!(result, Err(BrokerError::PublishFailed(_))));
    }

    #[tokio::test]
    async fn cancelled_run_returns() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_handle, driver) = build(
            &settings(),
            TopicRegistry::standard(),
            Arc::new(ConnectionStatus::new()),
            tx,
            cancel.clone(),
        )
        .unwrap();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), driver.run())
            .await
            .unwrap();
    }
}
