//! Application Layer - Use cases and port definitions.
//!
//! Wires the domain's normalization and classification into the ingestion
//! pipeline, and defines the interfaces the infrastructure adapters implement.

/// Port interfaces for the broker and the client fan-out.
pub mod ports;

/// Application services (ingestion pipeline).
pub mod services;
