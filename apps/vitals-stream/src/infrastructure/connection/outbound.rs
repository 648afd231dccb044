//! Outbound Buffer
//!
//! FIFO queue for publishes made while the link is down (or while an
//! earlier backlog is still draining). The queue is bounded; what happens
//! on overflow is decided by [`OverflowPolicy`].

use std::collections::VecDeque;

use serde_json::Value;

/// What to do when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room.
    #[default]
    DropOldest,
    /// Refuse the new message.
    RejectNew,
}

impl OverflowPolicy {
    /// Parse a policy name, defaulting to `DropOldest`.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().replace('_', "-").as_str() {
            "reject-new" => Self::RejectNew,
            _ => Self::DropOldest,
        }
    }

    /// Policy name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DropOldest => "drop-oldest",
            Self::RejectNew => "reject-new",
        }
    }
}

/// A publish waiting for a live link.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    /// Destination topic.
    pub topic: String,
    /// JSON body.
    pub payload: Value,
}

/// Result of enqueueing a message.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// Queued without loss.
    Queued,
    /// Queued after evicting the returned message.
    DroppedOldest(PendingMessage),
    /// Not queued; the buffer was full.
    Rejected(PendingMessage),
}

/// Bounded FIFO of pending publishes.
#[derive(Debug)]
pub struct OutboundBuffer {
    queue: VecDeque<PendingMessage>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundBuffer {
    /// Create a buffer holding at most `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    /// Append a message at the back.
    pub fn enqueue(&mut self, topic: impl Into<String>, payload: Value) -> EnqueueOutcome {
        let message = PendingMessage {
            topic: topic.into(),
            payload,
        };

        if self.queue.len() < self.capacity {
            self.queue.push_back(message);
            return EnqueueOutcome::Queued;
        }

        match self.policy {
            OverflowPolicy::RejectNew => EnqueueOutcome::Rejected(message),
            OverflowPolicy::DropOldest => {
                let evicted = self.queue.pop_front();
                self.queue.push_back(message);
                evicted.map_or(EnqueueOutcome::Queued, EnqueueOutcome::DroppedOldest)
            }
        }
    }

    /// Put a message that failed to send back at the front.
    ///
    /// A full buffer gives up its newest message to make room, which is
    /// returned.
    #[must_use = "an evicted message is lost unless reported"]
    pub fn requeue_front(&mut self, message: PendingMessage) -> Option<PendingMessage> {
        self.queue.push_front(message);
        if self.queue.len() > self.capacity {
            self.queue.pop_back()
        } else {
            None
        }
    }

    /// Take the oldest message.
    pub fn pop_front(&mut self) -> Option<PendingMessage> {
        self.queue.pop_front()
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Configured bound.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured overflow policy.
    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}
