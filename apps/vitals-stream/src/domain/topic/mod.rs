//! Topic Patterns
//!
//! MQTT-style topic filters used by the subscription registry.
//!
//! A pattern is split into `/`-separated segments:
//!
//! - `+` matches exactly one topic segment
//! - `#` matches the remainder of the topic (zero or more segments) and
//!   terminates matching
//! - any other segment must match literally
//!
//! A pattern without `#` only matches topics with the same segment count.
//!
//! Topics under the `$SYSTEM/` prefix are local pseudo-topics: they are
//! never registered with the broker and only carry synthetic connection
//! notifications.

use std::fmt;

/// Prefix reserved for local connection notifications.
pub const SYSTEM_PREFIX: &str = "$SYSTEM/";

/// Emitted after the transport is established.
pub const SYSTEM_CONNECTED: &str = "$SYSTEM/connected";

/// Emitted after the transport closes.
pub const SYSTEM_DISCONNECTED: &str = "$SYSTEM/disconnected";

/// Emitted when the transport reports an error.
pub const SYSTEM_ERROR: &str = "$SYSTEM/error";

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// How a pattern is routed by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    /// A concrete broker topic, registered with the transport.
    Literal,
    /// A filter containing `+` or `#`; matched locally against inbound topics.
    Wildcard,
    /// A `$SYSTEM/` pseudo-topic; local only.
    System,
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    kind: PatternKind,
}

impl TopicPattern {
    /// Parse a pattern string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let kind = if raw.starts_with(SYSTEM_PREFIX) {
            PatternKind::System
        } else if raw
            .split('/')
            .any(|segment| segment == SINGLE_LEVEL || segment == MULTI_LEVEL)
        {
            PatternKind::Wildcard
        } else {
            PatternKind::Literal
        };
        Self { raw, kind }
    }

    /// The pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Routing kind of this pattern.
    #[must_use]
    pub const fn kind(&self) -> PatternKind {
        self.kind
    }

    /// Whether the pattern must be registered with the broker.
    #[must_use]
    pub const fn is_transport_backed(&self) -> bool {
        matches!(self.kind, PatternKind::Literal)
    }

    /// Whether the pattern contains wildcard segments.
    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        matches!(self.kind, PatternKind::Wildcard)
    }

    /// Check whether `topic` matches this pattern.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        match self.kind {
            PatternKind::Literal | PatternKind::System => self.raw == topic,
            PatternKind::Wildcard => wildcard_matches(&self.raw, topic),
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for TopicPattern {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for TopicPattern {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Whether a topic is a local `$SYSTEM/` pseudo-topic.
#[must_use]
pub fn is_system_topic(topic: &str) -> bool {
    topic.starts_with(SYSTEM_PREFIX)
}

/// Segment-wise wildcard match of `topic` against `pattern`.
#[must_use]
pub fn wildcard_matches(pattern: &str, topic: &str) -> bool {
    let mut topic_segments = topic.split('/');

    for segment in pattern.split('/') {
        if segment == MULTI_LEVEL {
            return true;
        }

        let Some(topic_segment) = topic_segments.next() else {
            return false;
        };

        if segment != SINGLE_LEVEL && segment != topic_segment {
            return false;
        }
    }

    topic_segments.next().is_none()
}

/// Per-classroom vitals broadcast topic.
#[must_use]
pub fn classroom_vitals_topic(classroom_id: &str) -> String {
    format!("/topic/classroom/{classroom_id}/vitals")
}

/// Per-classroom alert broadcast topic.
#[must_use]
pub fn classroom_alerts_topic(classroom_id: &str) -> String {
    format!("/topic/classroom/{classroom_id}/alerts")
}

/// Global alert broadcast topic.
pub const GLOBAL_ALERTS_TOPIC: &str = "/topic/alerts";

/// Vitals from any classroom.
pub const ANY_CLASSROOM_VITALS: &str = "/topic/classroom/+/vitals";

/// Alerts from any classroom.
pub const ANY_CLASSROOM_ALERTS: &str = "/topic/classroom/+/alerts";

/// Application destination for vitals push requests.
pub const VITALS_REQUEST_TOPIC: &str = "/app/vitals/request";
