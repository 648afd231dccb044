//! Vitals Monitor
//!
//! Owns the roster, the reducer, the liveness sweep and the alert
//! correlator, and runs them as ordered steps on one task:
//!
//! ```text
//! MonitorHandle / sinks ──commands──▶ VitalsMonitor::run
//!                                      ├─ commit timer (debounced)
//!                                      ├─ sweep interval
//!                                      └─ snapshot watch ──▶ observers
//! ```
//!
//! The select loop is biased so a commit due at the same instant as a
//! sweep always lands first, and the sweep reads the committed state.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::timer::CancellableTimer;
use crate::domain::alert::{AlertCorrelator, AlertEvent, AlertLog, CorrelationChange};
use crate::domain::subscription::{InboundMessage, MessageSink, SinkError};
use crate::domain::vitals::{
    EntityId, EntityVitalsState, LivenessMonitor, Roster, RosterCounts, RosterEntry, StageOutcome,
    StatusThresholds, VitalsReducer, VitalsSample,
};
use crate::infrastructure::metrics;

// =============================================================================
// Settings
// =============================================================================

/// Timing and threshold settings for the monitor.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Debounce delay between the last staged sample and the commit.
    pub commit_delay: Duration,
    /// Period of the liveness sweep.
    pub sweep_interval: Duration,
    /// Age after which an online student is marked offline.
    pub offline_threshold: Duration,
    /// How long a streamed alert keeps a student in the alert set.
    pub alert_hold: Duration,
    /// Bound of the alert history.
    pub alert_log_capacity: usize,
    /// Status tier boundaries.
    pub thresholds: StatusThresholds,
}

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            commit_delay: Duration::from_millis(500),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            offline_threshold: Duration::from_secs(30),
            alert_hold: Duration::from_secs(60),
            alert_log_capacity: 200,
            thresholds: StatusThresholds::default(),
        }
    }
}

// =============================================================================
// Commands and Snapshot
// =============================================================================

/// Requests handled by the monitor task.
#[derive(Debug, Clone)]
pub enum MonitorCommand {
    /// Switch to a new roster.
    ResetRoster {
        /// Classroom to monitor, `None` for any.
        classroom_id: Option<String>,
        /// Students to track.
        entries: Vec<RosterEntry>,
    },
    /// Raw vitals payload.
    Sample(Value),
    /// Raw alert payload.
    Alert(Value),
    /// Fetched alert list replacing the streamed feed.
    ReplaceAlertFeed(Vec<AlertEvent>),
    /// Remove one alert log entry by id.
    ClearAlert(String),
    /// Remove every alert log entry.
    ClearAllAlerts,
}

/// Immutable view of the monitor state.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    /// Incremented on every published change.
    pub revision: u64,
    /// Number of commits applied so far.
    pub commits: u64,
    /// Scope generation.
    pub scope: u64,
    /// Monitored classroom.
    pub classroom_id: Option<String>,
    /// Students ordered by id.
    pub students: Vec<EntityVitalsState>,
    /// Alert history, newest first.
    pub alerts: Vec<AlertEvent>,
    /// Students currently in the alert set.
    pub alerted: Vec<EntityId>,
    /// Aggregate counts.
    pub counts: RosterCounts,
}

impl MonitorSnapshot {
    /// State of one student.
    #[must_use]
    pub fn student(&self, id: &str) -> Option<&EntityVitalsState> {
        self.students.iter().find(|s| s.student_id == id)
    }
}

// =============================================================================
// Handle and Sinks
// =============================================================================

/// Cloneable handle to a running monitor.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    commands: mpsc::UnboundedSender<MonitorCommand>,
    snapshot: watch::Receiver<Arc<MonitorSnapshot>>,
}

impl MonitorHandle {
    fn send(&self, command: MonitorCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Monitor stopped, command dropped");
        }
    }

    /// Replace the monitored roster.
    pub fn reset_roster(&self, classroom_id: Option<String>, entries: Vec<RosterEntry>) {
        self.send(MonitorCommand::ResetRoster {
            classroom_id,
            entries,
        });
    }

    /// Submit a raw vitals payload.
    pub fn submit_sample(&self, payload: Value) {
        self.send(MonitorCommand::Sample(payload));
    }

    /// Submit a raw alert payload.
    pub fn submit_alert(&self, payload: Value) {
        self.send(MonitorCommand::Alert(payload));
    }

    /// Replace the alert feed with a fetched list.
    pub fn replace_alert_feed(&self, events: Vec<AlertEvent>) {
        self.send(MonitorCommand::ReplaceAlertFeed(events));
    }

    /// Remove one alert log entry.
    pub fn clear_alert(&self, id: impl Into<String>) {
        self.send(MonitorCommand::ClearAlert(id.into()));
    }

    /// Remove every alert log entry.
    pub fn clear_all_alerts(&self) {
        self.send(MonitorCommand::ClearAllAlerts);
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<MonitorSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified on every published snapshot.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<MonitorSnapshot>> {
        self.snapshot.clone()
    }

    /// Sink forwarding vitals messages into this monitor.
    #[must_use]
    pub fn vitals_sink(&self) -> VitalsSink {
        VitalsSink(self.commands.clone())
    }

    /// Sink forwarding alert messages into this monitor.
    #[must_use]
    pub fn alert_sink(&self) -> AlertSink {
        AlertSink(self.commands.clone())
    }
}

/// Subscriber that feeds vitals payloads to the monitor.
#[derive(Debug, Clone)]
pub struct VitalsSink(mpsc::UnboundedSender<MonitorCommand>);

impl MessageSink for VitalsSink {
    fn deliver(&self, message: &InboundMessage) -> Result<(), SinkError> {
        self.0
            .send(MonitorCommand::Sample(message.payload.clone()))
            .map_err(|_| SinkError("monitor stopped".to_string()))
    }
}

/// Subscriber that feeds alert payloads to the monitor.
#[derive(Debug, Clone)]
pub struct AlertSink(mpsc::UnboundedSender<MonitorCommand>);

impl MessageSink for AlertSink {
    fn deliver(&self, message: &InboundMessage) -> Result<(), SinkError> {
        self.0
            .send(MonitorCommand::Alert(message.payload.clone()))
            .map_err(|_| SinkError("monitor stopped".to_string()))
    }
}

// =============================================================================
// Monitor Task
// =============================================================================

/// The monitor task state.
pub struct VitalsMonitor {
    settings: MonitorSettings,
    roster: Roster,
    reducer: VitalsReducer,
    liveness: LivenessMonitor,
    correlator: AlertCorrelator,
    alert_log: AlertLog,
    commit_timer: CancellableTimer,
    commands: mpsc::UnboundedReceiver<MonitorCommand>,
    snapshot_tx: watch::Sender<Arc<MonitorSnapshot>>,
    cancel: CancellationToken,
    revision: u64,
    commits: u64,
}

impl VitalsMonitor {
    /// Create a monitor and its handle.
    #[must_use]
    pub fn new(settings: MonitorSettings, cancel: CancellationToken) -> (Self, MonitorHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(MonitorSnapshot::default()));

        let monitor = Self {
            liveness: LivenessMonitor::new(settings.offline_threshold),
            correlator: AlertCorrelator::new(settings.alert_hold),
            alert_log: AlertLog::new(settings.alert_log_capacity),
            settings,
            roster: Roster::new(),
            reducer: VitalsReducer::new(),
            commit_timer: CancellableTimer::new(),
            commands,
            snapshot_tx,
            cancel,
            revision: 0,
            commits: 0,
        };
        let handle = MonitorHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        };
        (monitor, handle)
    }

    /// Run until cancelled or every handle is dropped.
    pub async fn run(mut self) {
        let period = if self.settings.sweep_interval.is_zero() {
            tracing::warn!(
                fallback_secs = DEFAULT_SWEEP_INTERVAL.as_secs(),
                "Zero sweep interval, using default"
            );
            DEFAULT_SWEEP_INTERVAL
        } else {
            self.settings.sweep_interval
        };
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            commit_delay_ms = self.settings.commit_delay.as_millis(),
            sweep_interval_secs = period.as_secs(),
            offline_threshold_secs = self.settings.offline_threshold.as_secs(),
            "Vitals monitor started"
        );

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::info!("Vitals monitor cancelled");
                    break;
                }
                () = self.commit_timer.fired() => {
                    self.commit_timer.cancel();
                    self.commit();
                }
                _ = sweep.tick() => self.sweep(),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        tracing::debug!("All monitor handles dropped");
                        break;
                    }
                },
            }
        }
    }

    fn handle(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::ResetRoster {
                classroom_id,
                entries,
            } => self.reset_roster(classroom_id, entries),
            MonitorCommand::Sample(payload) => self.on_sample(&payload),
            MonitorCommand::Alert(payload) => self.on_alert(&payload),
            MonitorCommand::ReplaceAlertFeed(events) => self.replace_alert_feed(events),
            MonitorCommand::ClearAlert(id) => {
                if self.alert_log.clear(&id) {
                    self.publish();
                }
            }
            MonitorCommand::ClearAllAlerts => {
                if !self.alert_log.is_empty() {
                    self.alert_log.clear_all();
                    self.publish();
                }
            }
        }
    }

    fn reset_roster(&mut self, classroom_id: Option<String>, entries: Vec<RosterEntry>) {
        let scope = self.roster.reset(classroom_id, entries);
        let pruned = self.reducer.prune(&self.roster);
        if self.reducer.is_idle() {
            self.commit_timer.cancel();
        }

        let overlay = CorrelationChange {
            raised: self.correlator.active().iter().cloned().collect(),
            released: Vec::new(),
        };
        AlertCorrelator::apply(&overlay, &mut self.roster, &self.settings.thresholds);

        tracing::info!(
            scope = scope.value(),
            classroom = ?self.roster.classroom_id(),
            students = self.roster.len(),
            pruned,
            "Roster reset"
        );
        self.publish();
    }

    fn on_sample(&mut self, payload: &Value) {
        let outcome = VitalsSample::from_payload(payload)
            .and_then(|sample| self.reducer.stage(&self.roster, sample));

        match outcome {
            Ok(StageOutcome::Staged | StageOutcome::Replaced) => {
                self.commit_timer.schedule(self.settings.commit_delay);
            }
            Ok(StageOutcome::OutOfScope) => {
                tracing::debug!(
                    student = ?payload.get("studentId"),
                    classroom = ?payload.get("classroomId"),
                    "Sample outside monitored scope dropped"
                );
            }
            Err(e) => {
                metrics::record_invalid_sample();
                tracing::warn!(error = %e, "Invalid vitals sample dropped");
            }
        }
    }

    fn commit(&mut self) {
        let now = Instant::now().into_std();
        let alerted: BTreeSet<EntityId> = self.correlator.active().clone();
        let report = self.reducer.commit(
            &mut self.roster,
            &alerted,
            &self.settings.thresholds,
            now,
            Utc::now(),
        );

        if report.discarded > 0 {
            tracing::debug!(discarded = report.discarded, "Stale staged samples discarded");
        }
        if report.applied.is_empty() {
            return;
        }

        self.commits += 1;
        metrics::record_commit_batch(report.applied.len());
        tracing::debug!(batch = report.applied.len(), "Vitals committed");
        self.publish();
    }

    fn sweep(&mut self) {
        let now = Instant::now().into_std();
        let report = self.liveness.sweep(&mut self.roster, now);
        for id in &report.went_offline {
            tracing::info!(student = %id, "Student went offline");
        }

        let change = self.correlator.recompute(now);
        self.apply_correlation(&change);

        if report.refreshed > 0 || !report.went_offline.is_empty() || !change.is_empty() {
            self.publish();
        }
    }

    fn on_alert(&mut self, payload: &Value) {
        let event = match AlertEvent::from_payload(payload, Utc::now()) {
            Ok(event) => event,
            Err(e) => {
                metrics::record_malformed_payload();
                tracing::warn!(error = %e, "Invalid alert dropped");
                return;
            }
        };

        metrics::record_alert_received();
        tracing::info!(
            student = %event.student_id,
            heart_rate = event.current_heart_rate,
            threshold = event.threshold_heart_rate,
            "Heart rate alert"
        );

        let now = Instant::now().into_std();
        self.correlator.observe(event.student_id.clone(), now);
        self.alert_log.record(event);
        let change = self.correlator.recompute(now);
        self.apply_correlation(&change);
        self.publish();
    }

    fn replace_alert_feed(&mut self, events: Vec<AlertEvent>) {
        let now = Instant::now().into_std();
        let ids: Vec<EntityId> = events.iter().map(|e| e.student_id.clone()).collect();
        for event in events {
            self.alert_log.record(event);
        }
        self.correlator.replace_feed(ids, now);
        let change = self.correlator.recompute(now);
        self.apply_correlation(&change);
        self.publish();
    }

    fn apply_correlation(&mut self, change: &CorrelationChange) {
        if change.is_empty() {
            return;
        }
        tracing::debug!(
            raised = ?change.raised,
            released = ?change.released,
            "Alert set changed"
        );
        AlertCorrelator::apply(change, &mut self.roster, &self.settings.thresholds);
    }

    fn publish(&mut self) {
        self.revision += 1;
        let counts = self.roster.counts();
        metrics::set_student_liveness(counts.online, counts.offline);

        let snapshot = MonitorSnapshot {
            revision: self.revision,
            commits: self.commits,
            scope: self.roster.scope().value(),
            classroom_id: self.roster.classroom_id().map(str::to_string),
            students: self.roster.iter().cloned().collect(),
            alerts: self.alert_log.iter().cloned().collect(),
            alerted: self.correlator.active().iter().cloned().collect(),
            counts,
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}
