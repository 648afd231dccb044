//! Heartbeat
//!
//! Probes a live link at a fixed interval. Any inbound traffic counts as
//! activity; when nothing has arrived for longer than the timeout at the
//! moment a probe is due, the link is reported dead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::ConnectionSettings;

/// Probe cadence and dead-link threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between probes.
    pub interval: Duration,
    /// Silence after which the link is considered dead.
    pub timeout: Duration,
}

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, Duration::from_secs(60))
    }
}

impl HeartbeatConfig {
    /// Create a configuration.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Take the heartbeat fields of `ConnectionSettings`.
    #[must_use]
    pub const fn from_connection_settings(settings: &ConnectionSettings) -> Self {
        Self::new(settings.heartbeat_interval, settings.heartbeat_timeout)
    }

    /// What a due probe should do after `silent_for` without traffic.
    #[must_use]
    pub fn verdict(&self, silent_for: Duration) -> HeartbeatEvent {
        if silent_for > self.timeout {
            HeartbeatEvent::Dead { silent_for }
        } else {
            HeartbeatEvent::Probe
        }
    }
}

/// What the heartbeat asks the driver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping.
    Probe,
    /// The link went silent for longer than the timeout.
    Dead {
        /// Time since the last inbound frame.
        silent_for: Duration,
    },
}

/// Inbound activity of one link, written by the driver and read by the
/// heartbeat task.
#[derive(Debug)]
pub struct LinkActivity {
    last_inbound: Mutex<Instant>,
    unanswered: AtomicU32,
}

impl Default for LinkActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkActivity {
    /// Start with activity recorded now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_inbound: Mutex::new(Instant::now()),
            unanswered: AtomicU32::new(0),
        }
    }

    /// Record inbound traffic of any kind.
    pub fn touch(&self) {
        *self.last_inbound.lock() = Instant::now();
        self.unanswered.store(0, Ordering::Relaxed);
    }

    /// Probes sent since the last inbound traffic.
    #[must_use]
    pub fn unanswered(&self) -> u32 {
        self.unanswered.load(Ordering::Relaxed)
    }

    /// Time since the last inbound traffic.
    #[must_use]
    pub fn silent_for(&self) -> Duration {
        self.last_inbound.lock().elapsed()
    }

    fn probe_sent(&self) {
        self.unanswered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Heartbeat task for one link.
pub struct Heartbeat {
    config: HeartbeatConfig,
    activity: Arc<LinkActivity>,
    events: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl Heartbeat {
    /// Create a heartbeat reporting on `events`.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        activity: Arc<LinkActivity>,
        events: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            activity,
            events,
            cancel,
        }
    }

    /// Run until cancelled, the driver stops listening, or the link is
    /// reported dead.
    pub async fn run(self) {
        let period = if self.config.interval.is_zero() {
            tracing::warn!(
                fallback_secs = DEFAULT_INTERVAL.as_secs(),
                "Zero heartbeat interval, using default"
            );
            DEFAULT_INTERVAL
        } else {
            self.config.interval
        };
        let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticks.tick() => {}
            }

            let event = self.config.verdict(self.activity.silent_for());
            match event {
                HeartbeatEvent::Probe => self.activity.probe_sent(),
                HeartbeatEvent::Dead { silent_for } => {
                    tracing::warn!(
                        silent_secs = silent_for.as_secs(),
                        unanswered = self.activity.unanswered(),
                        "Heartbeat timeout"
                    );
                }
            }

            if self.events.send(event).await.is_err() {
                tracing::debug!("Heartbeat receiver gone");
                break;
            }
            if matches!(event, HeartbeatEvent::Dead { .. }) {
                break;
            }
        }
    }
}
