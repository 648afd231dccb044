//! Topic Subscription Registry
//!
//! Maps topic patterns to the local subscribers attached to them and
//! decides which subscribers receive an inbound message.
//!
//! # Design
//!
//! The registry tracks:
//! - Which pattern each subscriber is attached to
//! - Reference counting for broker-level registrations: a literal topic is
//!   registered with the transport when its first subscriber attaches and
//!   released when its last subscriber detaches
//! - Exact patterns (literal and `$SYSTEM/`) separately from wildcard
//!   patterns, so exact lookup and wildcard scan are two independent steps
//!
//! The registry is owned by the connection driver and is only touched from
//! that single task, so it carries no locking of its own.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::domain::topic::{PatternKind, TopicPattern};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for one attached subscriber.
pub type SubscriberId = u64;

/// A message routed to local subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Concrete topic the message arrived on.
    pub topic: String,
    /// Decoded JSON payload.
    pub payload: Value,
}

impl InboundMessage {
    /// Create a new inbound message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Failure reported by a sink while accepting a message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("subscriber rejected message: {0}")]
pub struct SinkError(pub String);

/// Receiver side of a subscription.
///
/// `deliver` runs on the connection driver task and must not block. A
/// returned error is logged and never affects other subscribers.
pub trait MessageSink: Send + Sync {
    /// Accept one inbound message.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber can no longer accept messages.
    fn deliver(&self, message: &InboundMessage) -> Result<(), SinkError>;
}

impl MessageSink for tokio::sync::mpsc::UnboundedSender<InboundMessage> {
    fn deliver(&self, message: &InboundMessage) -> Result<(), SinkError> {
        self.send(message.clone())
            .map_err(|_| SinkError("receiver dropped".to_string()))
    }
}

/// Adapts a closure into a [`MessageSink`].
pub struct CallbackSink<F>(F);

impl<F> CallbackSink<F>
where
    F: Fn(&InboundMessage) + Send + Sync,
{
    /// Wrap a callback.
    #[must_use]
    pub const fn new(callback: F) -> Self {
        Self(callback)
    }
}

impl<F> MessageSink for CallbackSink<F>
where
    F: Fn(&InboundMessage) + Send + Sync,
{
    fn deliver(&self, message: &InboundMessage) -> Result<(), SinkError> {
        (self.0)(message);
        Ok(())
    }
}

impl<F> fmt::Debug for CallbackSink<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallbackSink")
    }
}

impl fmt::Debug for dyn MessageSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageSink")
    }
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn MessageSink>;

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to broker-level registrations.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionChanges {
    /// Topics to register with the transport.
    pub subscribe: HashSet<String>,
    /// Topics to release at the transport.
    pub unsubscribe: HashSet<String>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Create changes with only unsubscribes.
    #[must_use]
    pub fn unsubscribe_only(topics: impl IntoIterator<Item = String>) -> Self {
        Self {
            subscribe: HashSet::new(),
            unsubscribe: topics.into_iter().collect(),
        }
    }
}

/// Number of deliveries made for one inbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Deliveries through the exact-pattern lookup.
    pub exact: usize,
    /// Deliveries through the wildcard scan.
    pub wildcard: usize,
    /// Sinks that returned an error.
    pub failed: usize,
}

impl DispatchReport {
    /// Total successful deliveries.
    #[must_use]
    pub const fn delivered(&self) -> usize {
        self.exact + self.wildcard
    }
}

// =============================================================================
// Registry
// =============================================================================

struct PatternEntry {
    pattern: TopicPattern,
    subscribers: BTreeMap<SubscriberId, SharedSink>,
}

impl PatternEntry {
    fn new(pattern: TopicPattern) -> Self {
        Self {
            pattern,
            subscribers: BTreeMap::new(),
        }
    }

    fn deliver_all(&self, message: &InboundMessage, failed: &mut usize) -> usize {
        let mut delivered = 0;
        for (id, sink) in &self.subscribers {
            match sink.deliver(message) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    *failed += 1;
                    tracing::debug!(
                        subscriber = id,
                        pattern = %self.pattern,
                        error = %e,
                        "Subscriber failed to accept message"
                    );
                }
            }
        }
        delivered
    }
}

/// Registry of local subscribers keyed by topic pattern.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use vitals_stream::domain::subscription::{CallbackSink, InboundMessage, SubscriptionRegistry};
///
/// let mut registry = SubscriptionRegistry::new();
/// let sink = Arc::new(CallbackSink::new(|_msg: &InboundMessage| {}));
///
/// // First subscriber on a literal topic needs a broker registration
/// let changes = registry.add(1, "/topic/alerts".into(), sink.clone());
/// assert!(changes.subscribe.contains("/topic/alerts"));
///
/// // Second subscriber shares it
/// let changes = registry.add(2, "/topic/alerts".into(), sink);
/// assert!(changes.is_empty());
///
/// // Releasing the last subscriber releases the broker registration
/// registry.remove(1);
/// let changes = registry.remove(2);
/// assert!(changes.unsubscribe.contains("/topic/alerts"));
/// ```
#[derive(Default)]
pub struct SubscriptionRegistry {
    exact: HashMap<String, PatternEntry>,
    wildcard: HashMap<String, PatternEntry>,
    owners: HashMap<SubscriberId, TopicPattern>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber to a pattern.
    ///
    /// Returns the broker registrations this causes (only for the first
    /// subscriber of a literal topic). Re-using an id that is already
    /// attached moves it to the new pattern.
    pub fn add(
        &mut self,
        id: SubscriberId,
        pattern: TopicPattern,
        sink: SharedSink,
    ) -> SubscriptionChanges {
        let mut changes = if self.owners.contains_key(&id) {
            self.remove(id)
        } else {
            SubscriptionChanges::default()
        };

        let table = self.table_mut(pattern.kind());
        let entry = table
            .entry(pattern.as_str().to_string())
            .or_insert_with(|| PatternEntry::new(pattern.clone()));
        let first = entry.subscribers.is_empty();
        entry.subscribers.insert(id, sink);

        if first && pattern.is_transport_backed() {
            let topic = pattern.as_str().to_string();
            // Detach-then-attach on the same topic cancels out.
            if !changes.unsubscribe.remove(&topic) {
                changes.subscribe.insert(topic);
            }
        }

        self.owners.insert(id, pattern);
        changes
    }

    /// Detach a subscriber.
    ///
    /// Returns the broker registrations to release (when the last
    /// subscriber of a literal topic detaches). Unknown ids are a no-op.
    pub fn remove(&mut self, id: SubscriberId) -> SubscriptionChanges {
        let Some(pattern) = self.owners.remove(&id) else {
            return SubscriptionChanges::default();
        };

        let table = self.table_mut(pattern.kind());
        let Some(entry) = table.get_mut(pattern.as_str()) else {
            return SubscriptionChanges::default();
        };

        entry.subscribers.remove(&id);
        if !entry.subscribers.is_empty() {
            return SubscriptionChanges::default();
        }

        table.remove(pattern.as_str());
        if pattern.is_transport_backed() {
            SubscriptionChanges::unsubscribe_only([pattern.as_str().to_string()])
        } else {
            SubscriptionChanges::default()
        }
    }

    /// Deliver to subscribers registered under exactly `message.topic`.
    pub fn dispatch_exact(&self, message: &InboundMessage) -> DispatchReport {
        let mut report = DispatchReport::default();
        if let Some(entry) = self.exact.get(&message.topic) {
            report.exact = entry.deliver_all(message, &mut report.failed);
        }
        report
    }

    /// Deliver to subscribers of every wildcard pattern matching `message.topic`.
    pub fn dispatch_wildcard(&self, message: &InboundMessage) -> DispatchReport {
        let mut report = DispatchReport::default();
        for entry in self.wildcard.values() {
            if entry.pattern.matches(&message.topic) {
                report.wildcard += entry.deliver_all(message, &mut report.failed);
            }
        }
        report
    }

    /// Run both dispatch steps for one inbound message.
    pub fn dispatch(&self, message: &InboundMessage) -> DispatchReport {
        let exact = self.dispatch_exact(message);
        let wildcard = self.dispatch_wildcard(message);
        DispatchReport {
            exact: exact.exact,
            wildcard: wildcard.wildcard,
            failed: exact.failed + wildcard.failed,
        }
    }

    /// Literal topics that currently need a broker registration.
    #[must_use]
    pub fn transport_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .exact
            .values()
            .filter(|entry| entry.pattern.is_transport_backed())
            .map(|entry| entry.pattern.as_str().to_string())
            .collect();
        topics.sort();
        topics
    }

    /// Number of subscribers attached to a pattern.
    #[must_use]
    pub fn subscriber_count(&self, pattern: &str) -> usize {
        let pattern = TopicPattern::new(pattern);
        let table = match pattern.kind() {
            PatternKind::Wildcard => &self.wildcard,
            PatternKind::Literal | PatternKind::System => &self.exact,
        };
        table
            .get(pattern.as_str())
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            subscriber_count: self.owners.len(),
            exact_patterns: self.exact.len(),
            wildcard_patterns: self.wildcard.len(),
            transport_topics: self
                .exact
                .values()
                .filter(|entry| entry.pattern.is_transport_backed())
                .count(),
        }
    }

    fn table_mut(&mut self, kind: PatternKind) -> &mut HashMap<String, PatternEntry> {
        match kind {
            PatternKind::Wildcard => &mut self.wildcard,
            PatternKind::Literal | PatternKind::System => &mut self.exact,
        }
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Attached subscribers.
    pub subscriber_count: usize,
    /// Distinct exact patterns (literal and system).
    pub exact_patterns: usize,
    /// Distinct wildcard patterns.
    pub wildcard_patterns: usize,
    /// Literal topics registered with the broker.
    pub transport_topics: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::domain::topic::SYSTEM_CONNECTED;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl MessageSink for Counter {
        fn deliver(&self, _message: &InboundMessage) -> Result<(), SinkError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Counter {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Failing;

    impl MessageSink for Failing {
        fn deliver(&self, _message: &InboundMessage) -> Result<(), SinkError> {
            Err(SinkError("closed".to_string()))
        }
    }

    fn vitals(classroom: &str) -> InboundMessage {
        InboundMessage::new(
            format!("/topic/classroom/{classroom}/vitals"),
            json!({"studentId": "s1"}),
        )
    }

    #[test]
    fn first_literal_subscriber_registers_topic() {
        let mut registry = SubscriptionRegistry::new();
        let changes = registry.add(
            1,
            "/topic/classroom/42/vitals".into(),
            Arc::new(Counter::default()),
        );

        assert!(changes.subscribe.contains("/topic/classroom/42/vitals"));
        assert!(changes.unsubscribe.is_empty());
    }

    #[test]
    fn shared_literal_topic_is_reference_counted() {
        let mut registry = SubscriptionRegistry::new();
        let sink: SharedSink = Arc::new(Counter::default());

        registry.add(1, "/topic/alerts".into(), sink.clone());
        let second = registry.add(2, "/topic/alerts".into(), sink);
        assert!(second.is_empty());

        let first_gone = registry.remove(1);
        assert!(first_gone.is_empty());
        assert_eq!(registry.subscriber_count("/topic/alerts"), 1);

        let last_gone = registry.remove(2);
        assert!(last_gone.unsubscribe.contains("/topic/alerts"));
        assert!(registry.transport_topics().is_empty());
    }

    #[test]
    fn wildcard_and_system_patterns_never_touch_transport() {
        let mut registry = SubscriptionRegistry::new();
        let sink: SharedSink = Arc::new(Counter::default());

        assert!(
            registry
                .add(1, "/topic/classroom/+/vitals".into(), sink.clone())
                .is_empty()
        );
        assert!(registry.add(2, SYSTEM_CONNECTED.into(), sink).is_empty());
        assert!(registry.remove(1).is_empty());
        assert!(registry.remove(2).is_empty());
    }

    #[test]
    fn unsubscribe_removes_only_that_subscriber() {
        let mut registry = SubscriptionRegistry::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());

        registry.add(1, "/topic/alerts".into(), a.clone());
        registry.add(2, "/topic/alerts".into(), b.clone());
        registry.remove(1);

        let report = registry.dispatch(&InboundMessage::new("/topic/alerts", json!({})));
        assert_eq!(report.exact, 1);
        assert_eq!(a.count(), 0);
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn exact_dispatch_ignores_wildcards() {
        let mut registry = SubscriptionRegistry::new();
        let exact = Arc::new(Counter::default());
        let wildcard = Arc::new(Counter::default());

        registry.add(1, "/topic/classroom/42/vitals".into(), exact.clone());
        registry.add(2, "/topic/classroom/+/vitals".into(), wildcard.clone());

        let report = registry.dispatch_exact(&vitals("42"));
        assert_eq!(report.exact, 1);
        assert_eq!(report.wildcard, 0);
        assert_eq!(wildcard.count(), 0);
    }

    #[test]
    fn wildcard_dispatch_ignores_exact() {
        let mut registry = SubscriptionRegistry::new();
        let exact = Arc::new(Counter::default());
        let plus = Arc::new(Counter::default());
        let hash = Arc::new(Counter::default());

        registry.add(1, "/topic/classroom/42/vitals".into(), exact.clone());
        registry.add(2, "/topic/classroom/+/vitals".into(), plus.clone());
        registry.add(3, "/topic/classroom/#".into(), hash.clone());

        let report = registry.dispatch_wildcard(&vitals("42"));
        assert_eq!(report.wildcard, 2);
        assert_eq!(exact.count(), 0);
        assert_eq!(plus.count(), 1);
        assert_eq!(hash.count(), 1);
    }

    #[test]
    fn combined_dispatch_reaches_exact_and_wildcard() {
        let mut registry = SubscriptionRegistry::new();
        let exact = Arc::new(Counter::default());
        let plus = Arc::new(Counter::default());
        let unrelated = Arc::new(Counter::default());

        registry.add(1, "/topic/classroom/42/vitals".into(), exact.clone());
        registry.add(2, "/topic/classroom/+/vitals".into(), plus.clone());
        registry.add(3, "/topic/classroom/42/alerts".into(), unrelated.clone());

        let report = registry.dispatch(&vitals("42"));
        assert_eq!(report.delivered(), 2);
        assert_eq!(unrelated.count(), 0);

        let other_room = registry.dispatch(&vitals("7"));
        assert_eq!(other_room.exact, 0);
        assert_eq!(other_room.wildcard, 1);
    }

    #[test]
    fn failing_sink_does_not_block_others() {
        let mut registry = SubscriptionRegistry::new();
        let healthy = Arc::new(Counter::default());

        registry.add(1, "/topic/alerts".into(), Arc::new(Failing));
        registry.add(2, "/topic/alerts".into(), healthy.clone());

        let report = registry.dispatch(&InboundMessage::new("/topic/alerts", json!({})));
        assert_eq!(report.failed, 1);
        assert_eq!(report.exact, 1);
        assert_eq!(healthy.count(), 1);
    }

    #[test]
    fn channel_sink_receives_messages() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.add(1, "/topic/classroom/+/vitals".into(), Arc::new(tx));
        registry.dispatch(&vitals("9"));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.topic, "/topic/classroom/9/vitals");
    }

    #[test]
    fn moving_subscriber_to_new_pattern_releases_old_topic() {
        let mut registry = SubscriptionRegistry::new();
        let sink: SharedSink = Arc::new(Counter::default());

        registry.add(1, "/topic/classroom/1/vitals".into(), sink.clone());
        let changes = registry.add(1, "/topic/classroom/2/vitals".into(), sink);

        assert!(changes.unsubscribe.contains("/topic/classroom/1/vitals"));
        assert!(changes.subscribe.contains("/topic/classroom/2/vitals"));
        assert_eq!(registry.stats().subscriber_count, 1);
    }

    #[test]
    fn transport_topics_lists_literals_only() {
        let mut registry = SubscriptionRegistry::new();
        let sink: SharedSink = Arc::new(Counter::default());

        registry.add(1, "/topic/b".into(), sink.clone());
        registry.add(2, "/topic/a".into(), sink.clone());
        registry.add(3, "/topic/+".into(), sink.clone());
        registry.add(4, SYSTEM_CONNECTED.into(), sink);

        assert_eq!(registry.transport_topics(), vec!["/topic/a", "/topic/b"]);

        let stats = registry.stats();
        assert_eq!(stats.subscriber_count, 4);
        assert_eq!(stats.exact_patterns, 3);
        assert_eq!(stats.wildcard_patterns, 1);
        assert_eq!(stats.transport_topics, 2);
    }

    #[test]
    fn remove_unknown_subscriber_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.remove(99).is_empty());
    }
}
