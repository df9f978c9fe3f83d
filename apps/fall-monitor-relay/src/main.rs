//! Fall Monitor Relay Binary
//!
//! Starts the MQTT telemetry relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin fall-monitor-relay
//! ```
//!
//! # Environment Variables
//!
//! All optional.
//!
//! - `PORT`: HTTP and WebSocket port (default: 3001)
//! - `MQTT_HOST`: Broker host (default: broker.hivemq.com)
//! - `MQTT_PORT`: Broker port (default: 1883)
//! - `MQTT_PROTOCOL`: mqtt | mqtts (default: mqtt)
//! - `MQTT_CLIENT_ID`: Client id (default: generated)
//! - `MQTT_KEEP_ALIVE_SECS`: Keep-alive interval (default: 60)
//! - `MQTT_REQUEST_CAPACITY`: Outbound request queue (default: 64)
//! - `RELAY_RECONNECT_DELAY_INITIAL_MS`: First backoff delay (default: 1000)
//! - `RELAY_RECONNECT_DELAY_MAX_SECS`: Backoff cap (default: 30)
//! - `RELAY_RECONNECT_DELAY_MULTIPLIER`: Backoff multiplier (default: 2.0)
//! - `RELAY_CLIENT_QUEUE_CAPACITY`: Per-client queue (default: 256)
//! - `OTEL_ENABLED`: Export traces over OTLP (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: fall-monitor-relay)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fall_monitor_relay::infrastructure::broadcast::{BroadcastConfig, BroadcastHub};
use fall_monitor_relay::infrastructure::http::{AppState, HttpServer, HttpServerError};
use fall_monitor_relay::infrastructure::{mqtt, telemetry};
use fall_monitor_relay::{
    ConnectionStatus, RelayConfig, TelemetryPipeline, TopicRegistry, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (tracing + optional OpenTelemetry)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Fall Monitor Relay");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable, /metrics disabled");
    }

    let config = RelayConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let registry = TopicRegistry::standard();
    let status = Arc::new(ConnectionStatus::new());

    // Session hub for client fan-out
    let hub = Arc::new(BroadcastHub::new(
        BroadcastConfig::from(&config.pipeline),
        Arc::clone(&status),
        registry,
    ));

    // Broker client feeding the ingest channel
    let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
    let (broker, event_loop) = mqtt::build(
        &config.mqtt,
        registry,
        Arc::clone(&status),
        ingest_tx,
        shutdown_token.clone(),
    )
    .context("failed to configure MQTT client")?;

    // HTTP server
    let state = Arc::new(AppState::new(
        Arc::clone(&status),
        registry,
        Arc::clone(&hub),
        Arc::new(broker),
        shutdown_token.clone(),
    ));
    let http_server = HttpServer::new(config.server.port, state, shutdown_token.clone());

    let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(3);

    tasks.push(tokio::spawn(event_loop.run()));

    let pipeline = TelemetryPipeline::new(Arc::clone(&hub));
    tasks.push(tokio::spawn(pipeline.run(ingest_rx, shutdown_token.clone())));

    let http_shutdown = shutdown_token.clone();
    let http_task = tokio::spawn(async move {
        let result = http_server.run().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "HTTP server error");
            http_shutdown.cancel();
        }
        result
    });

    tracing::info!(port = config.server.port, "Relay ready");

    await_shutdown(shutdown_token).await;

    drain_tasks(tasks, http_task, SHUTDOWN_TIMEOUT).await?;

    tracing::info!("Relay stopped");
    Ok(())
}

/// Wait for the background tasks to stop and surface an HTTP server failure.
///
/// Tasks still running after `timeout` are abandoned with a warning.
async fn drain_tasks(
    tasks: Vec<JoinHandle<()>>,
    http_task: JoinHandle<Result<(), HttpServerError>>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let drain = async {
        futures::future::join_all(tasks).await;
        http_task.await
    };

    match tokio::time::timeout(timeout, drain).await {
        Ok(joined) => joined
            .context("HTTP server task panicked")?
            .context("HTTP server failed"),
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "Tasks did not stop in time");
            Ok(())
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        port = config.server.port,
        mqtt_host = %config.mqtt.host,
        mqtt_port = config.mqtt.port,
        mqtt_protocol = config.mqtt.protocol.as_str(),
        "Configuration loaded"
    );
    tracing::debug!(
        client_id = %config.mqtt.client_id,
        client_queue_capacity = config.pipeline.client_queue_capacity,
        "Relay buffers"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT) or an internal cancel.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::info!("Internal shutdown requested");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use fall_monitor_relay::{BrokerError, BrokerPublisher};

    use super::*;

    struct IdleBroker;

    #[async_trait]
    impl BrokerPublisher for IdleBroker {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn server_on(port: u16, cancel: &CancellationToken) -> HttpServer {
        let registry = TopicRegistry::standard();
        let status = Arc::new(ConnectionStatus::new());
        let hub = Arc::new(BroadcastHub::new(
            BroadcastConfig::default(),
            Arc::clone(&status),
            registry,
        ));
        let state = Arc::new(AppState::new(
            status,
            registry,
            hub,
            Arc::new(IdleBroker),
            cancel.clone(),
        ));
        HttpServer::new(port, state, cancel.clone())
    }

    #[tokio::test]
    async fn bind_failure_fails_the_process() {
        let occupied = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let server = server_on(port, &cancel);

        let http_task = tokio::spawn(server.run());
        let worker = tokio::spawn(async {});

        let err = drain_tasks(vec![worker], http_task, Duration::from_secs(2))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("HTTP server failed"));
        assert!(matches!(
            err.downcast_ref::<HttpServerError>(),
            Some(HttpServerError::BindFailed(p, _)) if *p == port
        ));
    }

    #[tokio::test]
    async fn cancelled_server_drains_ok() {
        let cancel = CancellationToken::new();
        let server = server_on(0, &cancel);
        let http_task = tokio::spawn(server.run());
        let worker = tokio::spawn(async {});
        cancel.cancel();

        drain_tasks(vec![worker], http_task, Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stuck_task_times_out_without_error() {
        let worker = tokio::spawn(std::future::pending::<()>());
        let http_task = tokio::spawn(async { Ok(()) });

        drain_tasks(vec![worker], http_task, Duration::from_millis(20))
            .await
            .unwrap();
    }
}
