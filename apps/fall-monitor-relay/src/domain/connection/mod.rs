//! Broker Connection Status
//!
//! A single boolean describing whether the relay currently holds a live
//! broker session. The MQTT adapter is the only writer; the Control API and
//! the session hub read it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Thread-safe broker connection flag.
///
/// Starts disconnected.
#[derive(Debug, Default)]
pub struct ConnectionStatus {
    connected: AtomicBool,
}

impl ConnectionStatus {
    /// Create a new status in the disconnected state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
        }
    }

    /// Whether the broker session is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Record a successful connect. Returns the previous value.
    pub fn mark_connected(&self) -> bool {
        self.connected.swap(true, Ordering::AcqRel)
    }

    /// Record a lost connection. Returns the previous value.
    pub fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    /// Label used by the health report.
    #[must_use]
    pub fn label(&self) -> &'static str {
        if self.is_connected() {
            "connected"
        } else {
            "disconnected"
        }
    }
}

/// Shared connection status reference.
pub type SharedConnectionStatus = Arc<ConnectionStatus>;
