//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the process-level
//! plumbing: configuration, logging, and metrics.

/// MQTT broker client and reconnection policy.
pub mod mqtt;

/// Client session registry and event fan-out.
pub mod broadcast;

/// WebSocket client sessions.
pub mod websocket;

/// HTTP control surface (health, alert injection, publish passthrough).
pub mod http;

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing subscriber and OpenTelemetry integration.
pub mod telemetry;
