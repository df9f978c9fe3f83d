//! Reconnection Policy
//!
//! Exponential backoff with jitter between broker reconnection attempts.
//! The relay never gives up on the broker, so there is no attempt limit.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::MqttSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from broker settings.
    #[must_use]
    pub const fn from_mqtt_settings(settings: &MqttSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
        }
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use fall_monitor_relay::infrastructure::mqtt::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
/// let first = policy.next_delay();
/// assert!(first.as_millis() >= 900);
///
/// // Link came back
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Get the next delay, then grow the base delay toward the cap.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt_count = self.attempt_count.saturating_add(1);

        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        delay_with_jitter
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts since the last successful connection.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}
