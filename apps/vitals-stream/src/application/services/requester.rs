//! Vitals Requester
//!
//! Asks the backend to push vitals for the tracked students. One request
//! per student goes out at start, again on every tick while the broker
//! link is up, and whenever a refresh is asked for.
//!
//! Requests are ordinary publishes to [`VITALS_REQUEST_TOPIC`], so the
//! start-up round is buffered until the first connection.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::domain::topic::VITALS_REQUEST_TOPIC;
use crate::domain::vitals::EntityId;
use crate::infrastructure::connection::ConnectionHandle;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Why a request was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    /// First request after start.
    Initial,
    /// Periodic request while connected.
    Update,
    /// Explicit refresh.
    Immediate,
}

/// Body published to [`VITALS_REQUEST_TOPIC`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalsRequest {
    /// Student whose vitals are wanted.
    pub student_id: EntityId,
    /// Task the vitals belong to.
    pub task_id: String,
    /// Why the request was sent.
    pub request_type: RequestKind,
}

/// Requester settings.
#[derive(Debug, Clone)]
pub struct RequesterSettings {
    /// Task the requested vitals belong to.
    pub task_id: String,
    /// Period of the update requests.
    pub interval: Duration,
}

impl RequesterSettings {
    /// Settings for `task_id` at the default period.
    #[must_use]
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            interval: DEFAULT_INTERVAL,
        }
    }
}

#[derive(Debug)]
enum RequesterCommand {
    Refresh,
    Retarget(Vec<EntityId>),
}

/// Handle to a running requester.
#[derive(Debug, Clone)]
pub struct RequesterHandle {
    commands: mpsc::UnboundedSender<RequesterCommand>,
}

impl RequesterHandle {
    fn send(&self, command: RequesterCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Vitals requester stopped, command dropped");
        }
    }

    /// Request fresh vitals for every tracked student now.
    pub fn refresh(&self) {
        self.send(RequesterCommand::Refresh);
    }

    /// Track a different set of students, starting with an initial round.
    pub fn retarget(&self, students: Vec<EntityId>) {
        self.send(RequesterCommand::Retarget(students));
    }
}

/// Publishes vitals requests through the connection.
pub struct VitalsRequester {
    settings: RequesterSettings,
    students: Vec<EntityId>,
    connection: ConnectionHandle,
    commands: mpsc::UnboundedReceiver<RequesterCommand>,
    cancel: CancellationToken,
}

impl VitalsRequester {
    /// Create a requester for `students` and its handle.
    #[must_use]
    pub fn new(
        settings: RequesterSettings,
        students: Vec<EntityId>,
        connection: ConnectionHandle,
        cancel: CancellationToken,
    ) -> (Self, RequesterHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        (
            Self {
                settings,
                students,
                connection,
                commands: commands_rx,
                cancel,
            },
            RequesterHandle {
                commands: commands_tx,
            },
        )
    }

    /// Run until cancelled or every handle is dropped.
    pub async fn run(mut self) {
        let period = if self.settings.interval.is_zero() {
            tracing::warn!(
                fallback_secs = DEFAULT_INTERVAL.as_secs(),
                "Zero vitals request interval, using default"
            );
            DEFAULT_INTERVAL
        } else {
            self.settings.interval
        };
        let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            students = self.students.len(),
            task_id = %self.settings.task_id,
            interval_secs = period.as_secs(),
            "Vitals requester started"
        );
        self.request_all(RequestKind::Initial);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(RequesterCommand::Refresh) => self.request_all(RequestKind::Immediate),
                    Some(RequesterCommand::Retarget(students)) => {
                        self.students = students;
                        self.request_all(RequestKind::Initial);
                    }
                    None => {
                        tracing::debug!("All requester handles dropped");
                        break;
                    }
                },
                _ = ticks.tick() => {
                    if self.connection.status().is_connected() {
                        self.request_all(RequestKind::Update);
                    }
                }
            }
        }
    }

    fn request_all(&self, kind: RequestKind) {
        for student_id in &self.students {
            let request = VitalsRequest {
                student_id: student_id.clone(),
                task_id: self.settings.task_id.clone(),
                request_type: kind,
            };
            match serde_json::to_value(&request) {
                Ok(payload) => self.connection.publish(VITALS_REQUEST_TOPIC, payload),
                Err(e) => tracing::warn!(error = %e, "Failed to encode vitals request"),
            }
        }
        tracing::debug!(kind = ?kind, students = self.students.len(), "Vitals requested");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};

    use super::*;
    use crate::application::ports::OutboundFrame;
    use crate::infrastructure::connection::{ConnectionDriver, ConnectionOptions};
    use crate::infrastructure::transport::{MemoryBroker, MemoryTransport, PeerLink};

    struct Harness {
        connection: ConnectionHandle,
        broker: MemoryBroker,
        requester: RequesterHandle,
        cancel: CancellationToken,
    }

    fn start(students: &[&str]) -> Harness {
        let cancel = CancellationToken::new();
        let (transport, broker) = MemoryTransport::new();
        let (driver, connection) = ConnectionDriver::new(
            Arc::new(transport),
            ConnectionOptions::new("memory://broker"),
            cancel.clone(),
        );
        tokio::spawn(driver.run());

        let (requester, handle) = VitalsRequester::new(
            RequesterSettings::new("task-1"),
            students.iter().map(ToString::to_string).collect(),
            connection.clone(),
            cancel.clone(),
        );
        tokio::spawn(requester.run());

        Harness {
            connection,
            broker,
            requester: handle,
            cancel,
        }
    }

    /// Next vitals request the broker receives, skipping heartbeat pings.
    async fn next_request(peer: &mut PeerLink) -> Value {
        loop {
            match peer.next_frame().await {
                Some(OutboundFrame::Publish { topic, payload }) => {
                    assert_eq!(topic, VITALS_REQUEST_TOPIC);
                    return payload;
                }
                Some(_) => {}
                None => panic!("link closed"),
            }
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn request_body_uses_backend_field_names() {
        let request = VitalsRequest {
            student_id: "s1".to_string(),
            task_id: "t1".to_string(),
            request_type: RequestKind::Immediate,
        };
        assert_eq!(
            serde_json::to_value(request).unwrap(),
            json!({ "studentId": "s1", "taskId": "t1", "requestType": "IMMEDIATE" })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn initial_round_waits_for_the_first_connection() {
        let mut harness = start(&["s1", "s2"]);
        settle().await;
        assert_eq!(harness.connection.status().buffered, 2);

        harness.connection.connect(None);
        let mut peer = harness.broker.accept().await.unwrap();
        assert_eq!(
            next_request(&mut peer).await,
            json!({ "studentId": "s1", "taskId": "task-1", "requestType": "INITIAL" })
        );
        assert_eq!(next_request(&mut peer).await["studentId"], "s2");

        harness.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn updates_every_interval_only_while_connected() {
        let mut harness = start(&["s1"]);

        // Disconnected: the periodic round is skipped.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(harness.connection.status().buffered, 1);

        harness.connection.connect(None);
        let mut peer = harness.broker.accept().await.unwrap();
        assert_eq!(next_request(&mut peer).await["requestType"], "INITIAL");

        let connected_at = Instant::now();
        assert_eq!(next_request(&mut peer).await["requestType"], "UPDATE");
        assert_eq!(connected_at.elapsed(), Duration::from_secs(5));
        assert_eq!(next_request(&mut peer).await["requestType"], "UPDATE");
        assert_eq!(connected_at.elapsed(), Duration::from_secs(15));

        harness.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_requests_immediately() {
        let mut harness = start(&["s1"]);
        harness.connection.connect(None);
        let mut peer = harness.broker.accept().await.unwrap();
        assert_eq!(next_request(&mut peer).await["requestType"], "INITIAL");

        let asked_at = Instant::now();
        harness.requester.refresh();
        assert_eq!(next_request(&mut peer).await["requestType"], "IMMEDIATE");
        assert_eq!(asked_at.elapsed(), Duration::ZERO);

        harness.requester.retarget(vec!["s7".to_string()]);
        let request = next_request(&mut peer).await;
        assert_eq!(request["studentId"], "s7");
        assert_eq!(request["requestType"], "INITIAL");

        harness.cancel.cancel();
    }
}
