//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: Inbound messages by topic class, malformed payloads
//! - **Connection**: Link state, reconnect attempts, outbound buffer depth
//! - **Monitor**: Commit batch sizes, online/offline students, alerts
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::topic;
use crate::infrastructure::connection::{ConnectionState, OverflowPolicy};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Later calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Inbound traffic
    describe_counter!(
        "vitals_stream_messages_received_total",
        "Messages received from the broker by topic class"
    );
    describe_counter!(
        "vitals_stream_malformed_payloads_total",
        "Inbound frames or payloads dropped as malformed"
    );
    describe_counter!(
        "vitals_stream_invalid_samples_total",
        "Vitals samples rejected by validation"
    );

    // Connection
    describe_gauge!(
        "vitals_stream_connection_state",
        "Broker link state (0 disconnected, 1 connecting, 2 connected)"
    );
    describe_counter!(
        "vitals_stream_reconnects_total",
        "Reconnection attempts scheduled"
    );
    describe_gauge!(
        "vitals_stream_outbound_buffer_depth",
        "Messages waiting in the outbound buffer"
    );
    describe_counter!(
        "vitals_stream_outbound_dropped_total",
        "Outbound messages dropped by the overflow policy"
    );

    // Monitor
    describe_histogram!(
        "vitals_stream_commit_batch_size",
        "Students updated per committed batch"
    );
    describe_gauge!(
        "vitals_stream_students",
        "Roster members by liveness"
    );
    describe_counter!(
        "vitals_stream_alerts_received_total",
        "Alert events received"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric label for the kind of topic a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicClass {
    /// Local `$SYSTEM/` events.
    System,
    /// Per-classroom vitals.
    Vitals,
    /// Per-classroom or global alerts.
    Alerts,
    /// Anything else.
    Other,
}

impl TopicClass {
    /// Classify a concrete topic.
    #[must_use]
    pub fn of(topic_name: &str) -> Self {
        if topic::is_system_topic(topic_name) {
            Self::System
        } else if topic_name.ends_with("/vitals") {
            Self::Vitals
        } else if topic_name.ends_with("/alerts") {
            Self::Alerts
        } else {
            Self::Other
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Vitals => "vitals",
            Self::Alerts => "alerts",
            Self::Other => "other",
        }
    }
}

/// Record a message received from the broker.
pub fn record_message_received(topic_name: &str) {
    counter!(
        "vitals_stream_messages_received_total",
        "class" => TopicClass::of(topic_name).as_str()
    )
    .increment(1);
}

/// Record an inbound frame or payload dropped as malformed.
pub fn record_malformed_payload() {
    counter!("vitals_stream_malformed_payloads_total").increment(1);
}

/// Record a sample rejected by validation.
pub fn record_invalid_sample() {
    counter!("vitals_stream_invalid_samples_total").increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    let value = match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
    };
    gauge!("vitals_stream_connection_state").set(value);
}

/// Record a scheduled reconnection attempt.
pub fn record_reconnect_attempt() {
    counter!("vitals_stream_reconnects_total").increment(1);
}

/// Update the outbound buffer depth.
#[allow(clippy::cast_precision_loss)]
pub fn set_outbound_depth(depth: usize) {
    gauge!("vitals_stream_outbound_buffer_depth").set(depth as f64);
}

/// Record an outbound message dropped by the overflow policy.
pub fn record_outbound_dropped(policy: OverflowPolicy) {
    counter!(
        "vitals_stream_outbound_dropped_total",
        "policy" => policy.as_str()
    )
    .increment(1);
}

/// Record the size of a committed batch.
#[allow(clippy::cast_precision_loss)]
pub fn record_commit_batch(size: usize) {
    histogram!("vitals_stream_commit_batch_size").record(size as f64);
}

/// Update the online/offline student gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_student_liveness(online: usize, offline: usize) {
    gauge!("vitals_stream_students", "liveness" => "online").set(online as f64);
    gauge!("vitals_stream_students", "liveness" => "offline").set(offline as f64);
}

/// Record an alert event.
pub fn record_alert_received() {
    counter!("vitals_stream_alerts_received_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("$SYSTEM/connected", TopicClass::System ; "system")]
    #[test_case("/topic/classroom/c1/vitals", TopicClass::Vitals ; "classroom vitals")]
    #[test_case("/topic/classroom/c1/alerts", TopicClass::Alerts ; "classroom alerts")]
    #[test_case("/topic/alerts", TopicClass::Alerts ; "global alerts")]
    #[test_case("/topic/announcements", TopicClass::Other ; "other")]
    fn classifies_topics(name: &str, expected: TopicClass) {
        assert_eq!(TopicClass::of(name), expected);
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_message_received("/topic/alerts");
        record_outbound_dropped(OverflowPolicy::DropOldest);
        set_connection_state(ConnectionState::Connected);
        set_student_liveness(3, 1);
    }
}
