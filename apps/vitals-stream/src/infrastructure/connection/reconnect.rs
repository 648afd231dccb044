//! Reconnection Policy
//!
//! Exponential backoff with additive jitter for unexpected closures:
//!
//! ```text
//! delay(n) = min(max_delay, initial_delay * multiplier^n) + uniform(0, jitter_max)
//! ```
//!
//! where `n` is the number of attempts already scheduled. Once
//! `max_attempts` retries have been scheduled the policy gives up and
//! only an explicit reset re-arms it.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::ConnectionSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound of the exponential part.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound of the uniform jitter added to each delay.
    pub jitter_max: Duration,
    /// Maximum number of retries (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(2000),
            max_delay: Duration::from_secs(30),
            multiplier: 1.5,
            jitter_max: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from `ConnectionSettings`.
    #[must_use]
    pub const fn from_connection_settings(settings: &ConnectionSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_max: settings.reconnect_jitter_max,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Backoff before jitter for the given number of prior attempts.
    #[must_use]
    pub fn base_delay(&self, attempts: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let initial_millis = self.initial_delay.as_millis() as f64;
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let scaled = initial_millis * self.multiplier.powi(exponent);

        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() * 1000.0 {
            return self.max_delay;
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = scaled.max(0.0).round() as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Reconnection policy state.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Schedule the next retry and return its delay.
    ///
    /// Returns `None` once the attempt budget is spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        let base = self.config.base_delay(self.attempt_count);
        self.attempt_count += 1;
        Some(base + self.jitter())
    }

    /// Reset after a successful connection or an explicit reconnect.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Retries scheduled since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another retry may be scheduled.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    /// Policy configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    fn jitter(&self) -> Duration {
        let max_millis = u64::try_from(self.config.jitter_max.as_millis()).unwrap_or(u64::MAX);
        if max_millis == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(0..=max_millis))
    }
}
