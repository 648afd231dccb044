//! Connection Driver
//!
//! All connection state lives on one driver task. Callers hold a cheap
//! [`ConnectionHandle`] whose methods never block: they enqueue a command
//! and return. The driver loop serializes commands, link events, connect
//! outcomes and its own timers, so no two handlers ever run at once.
//!
//! ```text
//! ConnectionHandle ──commands──▶ ConnectionDriver::run ──frames──▶ Transport
//!                                 ├─ SubscriptionRegistry      ◀──frames──┘
//!                                 ├─ OutboundBuffer + flush timer
//!                                 ├─ ReconnectPolicy + retry timer
//!                                 └─ status watch ──▶ observers
//! ```
//!
//! Connect attempts run on spawned tasks and report back tagged with an
//! attempt id; an outcome whose id is no longer pending (after a
//! disconnect or an explicit reconnect) is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent, LinkActivity};
use super::outbound::{EnqueueOutcome, OutboundBuffer, OverflowPolicy, PendingMessage};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{
    CLOSE_ABNORMAL, CLOSE_NORMAL, Credential, InboundFrame, OutboundFrame, Transport,
    TransportError, TransportLink,
};
use crate::application::services::CancellableTimer;
use crate::domain::subscription::{
    InboundMessage, SharedSink, SubscriberId, SubscriptionChanges, SubscriptionRegistry,
};
use crate::domain::topic::{self, TopicPattern};
use crate::infrastructure::codec::EnvelopeCodec;
use crate::infrastructure::config::ConnectionSettings;
use crate::infrastructure::metrics;

// =============================================================================
// Options and Status
// =============================================================================

/// Static options for one connection driver.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Broker endpoint.
    pub endpoint: String,
    /// Backoff schedule.
    pub reconnect: ReconnectConfig,
    /// Dead-link detection.
    pub heartbeat: HeartbeatConfig,
    /// Delay between an explicit reconnect and the fresh attempt.
    pub settle_delay: Duration,
    /// Pacing between buffered publishes while draining.
    pub flush_interval: Duration,
    /// Outbound buffer bound.
    pub outbound_capacity: usize,
    /// Outbound overflow policy.
    pub overflow: OverflowPolicy,
    /// Upper bound on a single connect attempt.
    pub connect_timeout: Duration,
}

impl ConnectionOptions {
    /// Options with default timings.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            settle_delay: Duration::from_millis(500),
            flush_interval: Duration::from_millis(50),
            outbound_capacity: 256,
            overflow: OverflowPolicy::DropOldest,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Options from `ConnectionSettings`.
    #[must_use]
    pub fn from_connection_settings(
        endpoint: impl Into<String>,
        settings: &ConnectionSettings,
    ) -> Self {
        Self {
            reconnect: ReconnectConfig::from_connection_settings(settings),
            heartbeat: HeartbeatConfig::from_connection_settings(settings),
            settle_delay: settings.reconnect_settle,
            flush_interval: settings.flush_interval,
            outbound_capacity: settings.outbound_capacity,
            overflow: settings.outbound_overflow,
            ..Self::new(endpoint)
        }
    }
}

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No link and no attempt in flight.
    #[default]
    Disconnected,
    /// An attempt is in flight.
    Connecting,
    /// Link established.
    Connected,
}

impl ConnectionState {
    /// State name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Observable connection status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Link state.
    pub state: ConnectionState,
    /// Retries scheduled since the last successful connection.
    pub reconnect_attempts: u32,
    /// Time until the pending retry, in milliseconds.
    pub retry_in_ms: Option<u64>,
    /// Whether the caller disconnected on purpose.
    pub manual_disconnect: bool,
    /// Whether a retry is scheduled.
    pub retry_pending: bool,
    /// Whether the retry budget is spent.
    pub exhausted: bool,
    /// Publishes waiting in the outbound buffer.
    pub buffered: usize,
    /// Attached local subscribers.
    pub subscribers: usize,
}

impl ConnectionStatus {
    /// Whether the link is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug)]
enum Command {
    Connect(Option<Credential>),
    Disconnect,
    Reconnect,
    Publish {
        topic: String,
        payload: Value,
    },
    Subscribe {
        id: SubscriberId,
        pattern: TopicPattern,
        sink: SharedSink,
    },
    Unsubscribe(SubscriberId),
}

/// Cloneable, non-blocking handle to a connection driver.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionHandle {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Connection driver stopped, command dropped");
        }
    }

    /// Start connecting. No-op while connecting or connected.
    pub fn connect(&self, credential: Option<Credential>) {
        self.send(Command::Connect(credential));
    }

    /// Tear down the link on purpose. Suppresses automatic retries.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Tear down any link and connect afresh after the settle delay,
    /// bypassing the backoff schedule.
    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    /// Publish a payload, buffering it while the link is down.
    pub fn publish(&self, topic: impl Into<String>, payload: Value) {
        self.send(Command::Publish {
            topic: topic.into(),
            payload,
        });
    }

    /// Attach a subscriber to a topic pattern.
    pub fn subscribe(&self, pattern: impl Into<TopicPattern>, sink: SharedSink) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pattern = pattern.into();
        self.send(Command::Subscribe {
            id,
            pattern: pattern.clone(),
            sink,
        });
        Subscription {
            id,
            pattern,
            commands: self.commands.clone(),
            attached: true,
        }
    }

    /// Attach a channel subscriber and return its receiving end.
    pub fn subscribe_channel(
        &self,
        pattern: impl Into<TopicPattern>,
    ) -> (Subscription, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.subscribe(pattern, Arc::new(tx)), rx)
    }

    /// Latest status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

/// One attached subscriber. Dropping it detaches the subscriber.
#[must_use = "dropping a Subscription detaches its subscriber"]
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    pattern: TopicPattern,
    commands: mpsc::UnboundedSender<Command>,
    attached: bool,
}

impl Subscription {
    /// Subscriber id.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Pattern the subscriber is attached to.
    #[must_use]
    pub const fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    /// Detach now.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if std::mem::take(&mut self.attached) {
            let _ = self.commands.send(Command::Unsubscribe(self.id));
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

// =============================================================================
// Driver
// =============================================================================

struct AttemptOutcome {
    id: u64,
    result: Result<TransportLink, TransportError>,
}

struct ActiveLink {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
    activity: Arc<LinkActivity>,
    heartbeat_rx: mpsc::Receiver<HeartbeatEvent>,
    heartbeat_cancel: CancellationToken,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.heartbeat_cancel.cancel();
    }
}

enum LinkEvent {
    Frame(Option<InboundFrame>),
    Heartbeat(HeartbeatEvent),
}

async fn next_link_event(link: &mut Option<ActiveLink>) -> LinkEvent {
    let Some(link) = link else {
        return std::future::pending().await;
    };
    tokio::select! {
        frame = link.inbound.recv() => LinkEvent::Frame(frame),
        Some(event) = link.heartbeat_rx.recv() => LinkEvent::Heartbeat(event),
    }
}

/// The connection driver task.
pub struct ConnectionDriver {
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    codec: EnvelopeCodec,
    registry: SubscriptionRegistry,
    outbound: OutboundBuffer,
    policy: ReconnectPolicy,
    state: ConnectionState,
    manual: bool,
    exhausted: bool,
    credential: Option<Credential>,
    link: Option<ActiveLink>,
    attempt_seq: u64,
    pending_attempt: Option<u64>,
    attempts_tx: mpsc::UnboundedSender<AttemptOutcome>,
    attempts: mpsc::UnboundedReceiver<AttemptOutcome>,
    retry_timer: CancellableTimer,
    flush_timer: CancellableTimer,
    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
}

impl ConnectionDriver {
    /// Create a driver and its handle.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
        cancel: CancellationToken,
    ) -> (Self, ConnectionHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (attempts_tx, attempts) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let driver = Self {
            transport,
            codec: EnvelopeCodec::new(),
            registry: SubscriptionRegistry::new(),
            outbound: OutboundBuffer::new(options.outbound_capacity, options.overflow),
            policy: ReconnectPolicy::new(options.reconnect.clone()),
            options,
            state: ConnectionState::Disconnected,
            manual: false,
            exhausted: false,
            credential: None,
            link: None,
            attempt_seq: 0,
            pending_attempt: None,
            attempts_tx,
            attempts,
            retry_timer: CancellableTimer::new(),
            flush_timer: CancellableTimer::new(),
            commands,
            status_tx,
            cancel,
        };
        let handle = ConnectionHandle {
            commands: commands_tx,
            status: status_rx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (driver, handle)
    }

    /// Run until cancelled or every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!(endpoint = %self.options.endpoint, "Connection driver started");

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::info!("Connection driver cancelled");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::debug!("All connection handles dropped");
                        break;
                    }
                },
                Some(outcome) = self.attempts.recv() => self.on_attempt(outcome),
                event = next_link_event(&mut self.link) => self.on_link_event(event),
                () = self.retry_timer.fired() => {
                    self.retry_timer.cancel();
                    self.start_attempt();
                }
                () = self.flush_timer.fired() => {
                    self.flush_timer.cancel();
                    self.flush_next();
                }
            }
        }

        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(credential) => self.connect(credential),
            Command::Disconnect => self.disconnect(),
            Command::Reconnect => self.reconnect(),
            Command::Publish { topic, payload } => self.publish(topic, payload),
            Command::Subscribe { id, pattern, sink } => {
                tracing::debug!(id, pattern = %pattern, "Subscriber attached");
                let changes = self.registry.add(id, pattern, sink);
                self.apply_changes(&changes);
                self.publish_status();
            }
            Command::Unsubscribe(id) => {
                tracing::debug!(id, "Subscriber detached");
                let changes = self.registry.remove(id);
                self.apply_changes(&changes);
                self.publish_status();
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    fn connect(&mut self, credential: Option<Credential>) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            tracing::debug!(state = self.state.as_str(), "Connect ignored");
            return;
        }

        if credential.is_some() {
            self.credential = credential;
        }
        self.manual = false;
        if self.exhausted {
            self.exhausted = false;
            self.policy.reset();
        }
        self.retry_timer.cancel();
        self.start_attempt();
    }

    fn disconnect(&mut self) {
        // Flag first: anything observed after this point must not retry.
        self.manual = true;
        self.retry_timer.cancel();
        self.flush_timer.cancel();
        self.pending_attempt = None;

        if self.link.is_some() {
            for topic in self.registry.transport_topics() {
                let _ = self.send_frame(OutboundFrame::Unsubscribe { topic });
            }
            let _ = self.send_frame(OutboundFrame::Close {
                code: CLOSE_NORMAL,
                reason: "client disconnect".to_string(),
            });
            self.link = None;
            self.state = ConnectionState::Disconnected;
            tracing::info!("Disconnected from broker by request");
            self.emit_disconnected(CLOSE_NORMAL, "client disconnect");
        } else {
            self.state = ConnectionState::Disconnected;
        }
        self.publish_status();
    }

    fn reconnect(&mut self) {
        tracing::info!(
            settle_ms = self.options.settle_delay.as_millis(),
            "Explicit reconnect requested"
        );
        self.retry_timer.cancel();
        self.flush_timer.cancel();
        self.pending_attempt = None;

        if self.link.is_some() {
            let _ = self.send_frame(OutboundFrame::Close {
                code: CLOSE_NORMAL,
                reason: "reconnect".to_string(),
            });
            self.link = None;
            self.emit_disconnected(CLOSE_NORMAL, "reconnect");
        }

        self.manual = false;
        self.exhausted = false;
        self.policy.reset();
        self.state = ConnectionState::Disconnected;
        self.retry_timer.schedule(self.options.settle_delay);
        self.publish_status();
    }

    fn start_attempt(&mut self) {
        self.attempt_seq += 1;
        let id = self.attempt_seq;
        self.pending_attempt = Some(id);
        self.state = ConnectionState::Connecting;

        tracing::info!(
            endpoint = %self.options.endpoint,
            attempt = self.policy.attempt_count(),
            "Connecting to broker"
        );

        let transport = Arc::clone(&self.transport);
        let endpoint = self.options.endpoint.clone();
        let credential = self.credential.clone();
        let timeout = self.options.connect_timeout;
        let outcomes = self.attempts_tx.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(
                timeout,
                transport.connect(&endpoint, credential.as_ref()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::ConnectFailed(format!(
                    "timed out after {}s",
                    timeout.as_secs()
                )))
            });
            let _ = outcomes.send(AttemptOutcome { id, result });
        });

        self.publish_status();
    }

    fn on_attempt(&mut self, outcome: AttemptOutcome) {
        if self.pending_attempt != Some(outcome.id) {
            if let Ok(link) = outcome.result {
                tracing::debug!(attempt = outcome.id, "Discarding superseded link");
                let _ = link.outbound.send(OutboundFrame::Close {
                    code: CLOSE_NORMAL,
                    reason: "superseded".to_string(),
                });
            }
            return;
        }
        self.pending_attempt = None;

        match outcome.result {
            Ok(link) => self.on_established(link),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    attempts = self.policy.attempt_count(),
                    "Broker connection failed"
                );
                self.state = ConnectionState::Disconnected;
                self.emit_error(&e.to_string());
                self.schedule_retry();
                self.publish_status();
            }
        }
    }

    fn on_established(&mut self, link: TransportLink) {
        let activity = Arc::new(LinkActivity::new());
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(8);
        let heartbeat_cancel = self.cancel.child_token();
        tokio::spawn(
            Heartbeat::new(
                self.options.heartbeat,
                Arc::clone(&activity),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );

        self.link = Some(ActiveLink {
            outbound: link.outbound,
            inbound: link.inbound,
            activity,
            heartbeat_rx,
            heartbeat_cancel,
        });
        self.state = ConnectionState::Connected;
        self.policy.reset();
        self.exhausted = false;
        self.retry_timer.cancel();

        let topics = self.registry.transport_topics();
        tracing::info!(
            topics = topics.len(),
            buffered = self.outbound.len(),
            "Connected to broker"
        );

        for topic in topics {
            if self.send_frame(OutboundFrame::Subscribe { topic }).is_err() {
                self.on_closed(CLOSE_ABNORMAL, "send failed while registering topics");
                return;
            }
        }

        self.flush_next();
        if self.state != ConnectionState::Connected {
            return;
        }
        self.emit_system(
            topic::SYSTEM_CONNECTED,
            json!({ "timestamp": Utc::now().to_rfc3339() }),
        );
        self.publish_status();
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(Some(InboundFrame::Text(text))) => {
                self.record_activity();
                self.on_text(&text);
            }
            LinkEvent::Frame(Some(InboundFrame::Pong)) => self.record_activity(),
            LinkEvent::Frame(Some(InboundFrame::Unsent(frames))) => self.requeue_unsent(frames),
            LinkEvent::Frame(Some(InboundFrame::Closed { code, reason })) => {
                self.on_closed(code, &reason);
            }
            LinkEvent::Frame(None) => self.on_closed(CLOSE_ABNORMAL, "transport ended"),
            LinkEvent::Heartbeat(HeartbeatEvent::Probe) => {
                if self.send_frame(OutboundFrame::Ping).is_err() {
                    self.on_closed(CLOSE_ABNORMAL, "send failed");
                }
            }
            LinkEvent::Heartbeat(HeartbeatEvent::Dead { silent_for }) => {
                tracing::warn!(
                    silent_secs = silent_for.as_secs(),
                    "Broker link silent past heartbeat timeout"
                );
                self.on_closed(CLOSE_ABNORMAL, "heartbeat timeout");
            }
        }
    }

    fn on_closed(&mut self, code: u16, reason: &str) {
        if let Some(mut link) = self.link.take() {
            while let Ok(frame) = link.inbound.try_recv() {
                if let InboundFrame::Unsent(frames) = frame {
                    self.requeue_unsent(frames);
                }
            }
        }
        self.flush_timer.cancel();
        self.state = ConnectionState::Disconnected;

        let expected = code == CLOSE_NORMAL || self.manual;
        if expected {
            tracing::info!(code, reason, "Broker connection closed");
        } else {
            tracing::warn!(code, reason, "Broker connection lost");
        }

        self.emit_disconnected(code, reason);
        if !expected {
            self.schedule_retry();
        }
        self.publish_status();
    }

    fn schedule_retry(&mut self) {
        if self.manual {
            return;
        }

        match self.policy.next_delay() {
            Some(delay) => {
                self.retry_timer.schedule(delay);
                metrics::record_reconnect_attempt();
                tracing::info!(
                    attempt = self.policy.attempt_count(),
                    max_attempts = self.policy.config().max_attempts,
                    delay_ms = delay.as_millis(),
                    "Scheduling reconnect"
                );
            }
            None => {
                self.exhausted = true;
                tracing::warn!(
                    attempts = self.policy.attempt_count(),
                    "Maximum reconnect attempts reached, giving up"
                );
            }
        }
    }

    fn shutdown(&mut self) {
        self.retry_timer.cancel();
        self.flush_timer.cancel();
        self.pending_attempt = None;
        if self.link.is_some() {
            let _ = self.send_frame(OutboundFrame::Close {
                code: CLOSE_NORMAL,
                reason: "shutdown".to_string(),
            });
            self.link = None;
        }
        self.state = ConnectionState::Disconnected;
        self.publish_status();
    }

    // -------------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------------

    fn publish(&mut self, topic: String, payload: Value) {
        if self.state == ConnectionState::Connected && self.outbound.is_empty() {
            match self.send_frame(OutboundFrame::Publish { topic, payload }) {
                Ok(()) => return,
                Err(frame) => {
                    self.requeue(frame);
                    self.on_closed(CLOSE_ABNORMAL, "send failed");
                    return;
                }
            }
        }

        match self.outbound.enqueue(topic, payload) {
            EnqueueOutcome::Queued => {
                tracing::debug!(buffered = self.outbound.len(), "Publish buffered");
            }
            EnqueueOutcome::DroppedOldest(dropped) => {
                metrics::record_outbound_dropped(self.outbound.policy());
                tracing::warn!(topic = %dropped.topic, "Outbound buffer full, dropped oldest");
            }
            EnqueueOutcome::Rejected(rejected) => {
                metrics::record_outbound_dropped(self.outbound.policy());
                tracing::warn!(topic = %rejected.topic, "Outbound buffer full, publish rejected");
            }
        }
        metrics::set_outbound_depth(self.outbound.len());

        if self.state == ConnectionState::Connected && !self.flush_timer.is_armed() {
            self.flush_next();
        }
        self.publish_status();
    }

    fn flush_next(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(message) = self.outbound.pop_front() else {
            return;
        };

        let frame = OutboundFrame::Publish {
            topic: message.topic,
            payload: message.payload,
        };
        match self.send_frame(frame) {
            Ok(()) if self.outbound.is_empty() => {
                tracing::debug!("Outbound buffer drained");
            }
            Ok(()) => {
                self.flush_timer.schedule(self.options.flush_interval);
            }
            Err(frame) => {
                self.requeue(frame);
                self.on_closed(CLOSE_ABNORMAL, "send failed during flush");
            }
        }
        metrics::set_outbound_depth(self.outbound.len());
        self.publish_status();
    }

    fn requeue(&mut self, frame: OutboundFrame) {
        let OutboundFrame::Publish { topic, payload } = frame else {
            return;
        };
        if let Some(evicted) = self
            .outbound
            .requeue_front(PendingMessage { topic, payload })
        {
            metrics::record_outbound_dropped(self.outbound.policy());
            tracing::warn!(topic = %evicted.topic, "Outbound buffer full, dropped newest");
        }
    }

    /// Put publishes the link accepted but never wrote back ahead of the
    /// buffer, oldest first.
    fn requeue_unsent(&mut self, frames: Vec<OutboundFrame>) {
        tracing::info!(count = frames.len(), "Requeueing unsent publishes");
        for frame in frames.into_iter().rev() {
            self.requeue(frame);
        }
        metrics::set_outbound_depth(self.outbound.len());
    }

    fn on_text(&mut self, text: &str) {
        let message = match self.codec.decode(text) {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!("Envelope without topic dropped");
                return;
            }
            Err(e) => {
                metrics::record_malformed_payload();
                tracing::warn!(error = %e, "Malformed inbound message dropped");
                return;
            }
        };

        if topic::is_system_topic(&message.topic) {
            tracing::warn!(topic = %message.topic, "Broker message on a local-only topic dropped");
            return;
        }

        metrics::record_message_received(&message.topic);
        let report = self.registry.dispatch(&message);
        if report.failed > 0 {
            tracing::warn!(
                topic = %message.topic,
                failed = report.failed,
                "Subscriber delivery failed"
            );
        }
        tracing::trace!(
            topic = %message.topic,
            exact = report.exact,
            wildcard = report.wildcard,
            "Message dispatched"
        );
    }

    fn apply_changes(&mut self, changes: &SubscriptionChanges) {
        if changes.is_empty() || self.state != ConnectionState::Connected {
            return;
        }

        let mut released: Vec<&String> = changes.unsubscribe.iter().collect();
        released.sort();
        let mut registered: Vec<&String> = changes.subscribe.iter().collect();
        registered.sort();

        let frames = released
            .into_iter()
            .map(|topic| OutboundFrame::Unsubscribe {
                topic: topic.clone(),
            })
            .chain(registered.into_iter().map(|topic| OutboundFrame::Subscribe {
                topic: topic.clone(),
            }));
        for frame in frames {
            if self.send_frame(frame).is_err() {
                self.on_closed(CLOSE_ABNORMAL, "send failed while updating topics");
                return;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn send_frame(&self, frame: OutboundFrame) -> Result<(), OutboundFrame> {
        match &self.link {
            Some(link) => link.outbound.send(frame).map_err(|e| e.0),
            None => Err(frame),
        }
    }

    fn record_activity(&self) {
        if let Some(link) = &self.link {
            link.activity.touch();
        }
    }

    fn emit_system(&self, topic: &str, payload: Value) {
        let report = self.registry.dispatch(&InboundMessage::new(topic, payload));
        if report.failed > 0 {
            tracing::debug!(topic, failed = report.failed, "System event delivery failed");
        }
    }

    fn emit_disconnected(&self, code: u16, reason: &str) {
        self.emit_system(
            topic::SYSTEM_DISCONNECTED,
            json!({ "code": code, "reason": reason }),
        );
    }

    fn emit_error(&self, message: &str) {
        self.emit_system(
            topic::SYSTEM_ERROR,
            json!({
                "message": message,
                "timestamp": Utc::now().to_rfc3339(),
                "connectionState": self.state.as_str(),
                "reconnectAttempts": self.policy.attempt_count(),
            }),
        );
    }

    fn publish_status(&self) {
        let retry_in_ms = self
            .retry_timer
            .remaining()
            .map(|left| u64::try_from(left.as_millis()).unwrap_or(u64::MAX));
        let status = ConnectionStatus {
            state: self.state,
            reconnect_attempts: self.policy.attempt_count(),
            retry_in_ms,
            manual_disconnect: self.manual,
            retry_pending: self.retry_timer.is_armed(),
            exhausted: self.exhausted,
            buffered: self.outbound.len(),
            subscribers: self.registry.stats().subscriber_count,
        };
        metrics::set_connection_state(self.state);
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
