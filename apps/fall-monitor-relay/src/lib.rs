#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Fall Monitor Relay - MQTT Telemetry Fan-out
//!
//! Subscribes to the fall monitor's broker topics, normalizes every payload
//! into one event shape, flags manual controls and fall alerts in the logs,
//! and pushes each event to all connected WebSocket clients. A small HTTP
//! surface reports health, injects emergency alerts, and publishes to the
//! broker.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and functions
//!   - `topics`: The fixed topic registry
//!   - `connection`: Broker link status flag
//!   - `telemetry`: Payload normalization and event shapes
//!   - `classification`: Manual control and fall detection signals
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Broker publisher and event sink interfaces
//!   - `services`: The ingestion pipeline
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `mqtt`: Broker client with reconnect backoff
//!   - `broadcast`: Client session hub
//!   - `websocket`: Per-client WebSocket sessions
//!   - `http`: Control API and server
//!   - `config`, `metrics`, `telemetry`: Ambient concerns
//!
//! # Data Flow
//!
//! ```text
//!                 ┌────────────┐  ingest   ┌────────────┐     ┌───────────┐──► Client 1
//! MQTT broker ───►│ MQTT event │──────────►│  Telemetry │────►│  Session  │──► Client 2
//!                 │    loop    │  channel  │  pipeline  │     │    hub    │──► Client N
//!                 └────────────┘           └────────────┘     └───────────┘
//!                       ▲                                           ▲
//!                       └──── POST /publish ── HTTP API ── POST /alert
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Pure types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::classification::{ActivityState, ClassifiedSignal, ManualState, classify};
pub use domain::connection::{ConnectionStatus, SharedConnectionStatus};
pub use domain::telemetry::{EmergencyAlert, NormalizedEvent, RawMessage, normalize};
pub use domain::topics::{Topic, TopicRegistry};

// Application
pub use application::ports::{BrokerError, BrokerPublisher, EventSink};
pub use application::services::{ProcessOutcome, TelemetryPipeline};

// Infrastructure config
pub use infrastructure::config::{
    BrokerProtocol, ConfigError, MqttSettings, PipelineSettings, RelayConfig, ServerSettings,
};

// HTTP server
pub use infrastructure::http::{AppState, HttpServer, HttpServerError, create_router};

// Session hub
pub use infrastructure::broadcast::{
    BroadcastConfig, BroadcastHub, ClientEvent, ClientSession, SharedBroadcastHub,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
