//! Liveness Sweep
//!
//! Periodically downgrades students whose last committed sample is older
//! than the offline threshold and refreshes their "since update" text.

use std::time::{Duration, Instant};

use super::roster::{Liveness, Roster};
use super::sample::EntityId;
use super::status::VitalsStatus;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Students that went offline during this sweep.
    pub went_offline: Vec<EntityId>,
    /// Students whose "since update" text was refreshed.
    pub refreshed: usize,
}

/// Offline detection over a roster.
#[derive(Debug, Clone, Copy)]
pub struct LivenessMonitor {
    offline_threshold: Duration,
}

impl LivenessMonitor {
    /// Create a monitor with the given offline threshold.
    #[must_use]
    pub const fn new(offline_threshold: Duration) -> Self {
        Self { offline_threshold }
    }

    /// Offline threshold.
    #[must_use]
    pub const fn offline_threshold(&self) -> Duration {
        self.offline_threshold
    }

    /// Whether a sample committed at `last_update` is stale at `now`.
    #[must_use]
    pub fn is_stale(&self, last_update: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_update) > self.offline_threshold
    }

    /// Sweep every student once.
    pub fn sweep(&self, roster: &mut Roster, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for state in roster.iter_mut() {
            let Some(last_update) = state.last_update else {
                continue;
            };

            state.since_update = Some(format_since(now.saturating_duration_since(last_update)));
            report.refreshed += 1;

            if state.liveness == Liveness::Online && self.is_stale(last_update, now) {
                state.liveness = Liveness::Offline;
                state.status = VitalsStatus::Inactive;
                report.went_offline.push(state.student_id.clone());
            }
        }

        report
    }
}

/// Human-readable age of an update.
#[must_use]
pub fn format_since(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    match secs {
        0..5 => "just now".to_string(),
        5..60 => format!("{secs}s ago"),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86_400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
