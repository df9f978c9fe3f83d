//! HTTP Control API
//!
//! Health reporting, alert injection, publish passthrough, Prometheus
//! metrics, and the WebSocket upgrade, all on one port.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status: broker link, time, topic registry
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (broker connected)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `POST /alert` - Broadcast an emergency alert to every client
//! - `POST /publish` - Publish a JSON payload to the broker
//! - `GET /ws` - Upgrade to a client session

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::application::ports::{BrokerError, BrokerPublisher, EventSink};
use crate::domain::connection::SharedConnectionStatus;
use crate::domain::telemetry::{EmergencyAlert, iso_timestamp};
use crate::domain::topics::TopicRegistry;
use crate::infrastructure::broadcast::SharedBroadcastHub;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::websocket;

// =============================================================================
// State
// =============================================================================

/// Shared state for every handler.
pub struct AppState {
    status: SharedConnectionStatus,
    registry: TopicRegistry,
    hub: SharedBroadcastHub,
    broker: Arc<dyn BrokerPublisher>,
    shutdown: CancellationToken,
}

impl AppState {
    /// Create handler state.
    #[must_use]
    pub fn new(
        status: SharedConnectionStatus,
        registry: TopicRegistry,
        hub: SharedBroadcastHub,
        broker: Arc<dyn BrokerPublisher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            status,
            registry,
            hub,
            broker,
            shutdown,
        }
    }
}

// =============================================================================
// Responses and Errors
// =============================================================================

/// `GET /health` body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always "online" while the process serves requests.
    pub status: &'static str,
    /// "connected" or "disconnected".
    pub mqtt: &'static str,
    /// ISO-8601 response time.
    pub timestamp: String,
    /// Logical name to wire topic.
    pub topics: TopicRegistry,
}

/// Control API failures.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request body is missing required fields or is not JSON.
    #[error("{0}")]
    BadRequest(String),
    /// The broker refused the publish.
    #[error(transparent)]
    Publish(#[from] BrokerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// =============================================================================
// Router
// =============================================================================

/// Build the relay's router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/alert", post(alert_handler))
        .route("/publish", post(publish_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// HTTP Server
// =============================================================================

/// Control API and WebSocket server.
pub struct HttpServer {
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the server hits a fatal
    /// error while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if the server hits a fatal error.
    pub async fn run_on(self, listener: TcpListener) -> Result<(), HttpServerError> {
        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, "HTTP server listening");

        axum::serve(listener, create_router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "online",
        mqtt: state.status.label(),
        timestamp: iso_timestamp(Utc::now()),
        topics: state.registry,
    })
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.status.is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn alert_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let (Some(contact), Some(message)) = (required_text(&body, "contact"), required_text(&body, "message"))
    else {
        return Err(ApiError::BadRequest(
            "contact and message are required".to_string(),
        ));
    };

    let alert = EmergencyAlert::new(contact, message, Utc::now());
    let _ = state.hub.broadcast_alert(&alert);

    Ok(Json(json!({ "success": true, "message": "Alert sent" })))
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let (Some(topic), Some(data)) = (
        required_text(&body, "topic"),
        body.get("data").filter(|v| !v.is_null()),
    ) else {
        return Err(ApiError::BadRequest("topic and data are required".to_string()));
    };

    let payload =
        serde_json::to_vec(data).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state.broker.publish(&topic, payload).await?;

    Ok(Json(json!({ "success": true, "topic": topic, "data": data })))
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let hub = Arc::clone(&state.hub);
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| websocket::run_session(socket, hub, shutdown))
}

/// A non-empty string field.
fn required_text(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// =============================================================================
// Tests
// =============================================================================
