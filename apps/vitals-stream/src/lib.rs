#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Vitals Stream - Classroom Vitals Monitor
//!
//! Maintains one multiplexed connection to the classroom message broker,
//! routes topic traffic to local subscribers (exact topics and single-level
//! `+` wildcards), and folds per-student vitals and alert streams into a
//! stable monitoring view.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Pure state and rules
//!   - `topic`: Topic names, wildcard patterns, system pseudo-topics
//!   - `subscription`: Subscriber registry and dispatch
//!   - `vitals`: Samples, roster, debounced reducer, liveness
//!   - `alert`: Alert events, history, correlation set
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: The `Transport` port and its frame types
//!   - `services`: The vitals monitor task and the cancellable timer
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `connection`: Connection driver, reconnection, heartbeat, buffering
//!   - `codec`: JSON envelope encoding
//!   - `transport`: WebSocket and in-memory transports
//!   - `config`, `roster`: Environment configuration, roster seed file
//!   - `health`, `metrics`, `telemetry`: Operational surface
//!
//! # Data Flow
//!
//! ```text
//! Broker --> Transport --> ConnectionDriver --> SubscriptionRegistry
//!                                                   |
//!                                   +---------------+---------------+
//!                                   v                               v
//!                              VitalsSink                       AlertSink
//!                                   |                               |
//!                                   +--------> VitalsMonitor <------+
//!                                                   |
//!                                                   v
//!                                           MonitorSnapshot (watch)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types and rules with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::alert::{AlertEvent, AlertLog};
pub use domain::subscription::{
    InboundMessage, MessageSink, SharedSink, SubscriptionChanges, SubscriptionRegistry,
};
pub use domain::topic::TopicPattern;
pub use domain::vitals::{
    EntityVitalsState, Liveness, RosterEntry, StatusThresholds, VitalsSample, VitalsStatus,
};

// Ports
pub use application::ports::{
    Credential, InboundFrame, OutboundFrame, Transport, TransportError, TransportLink,
};

// Services
pub use application::services::{
    MonitorHandle, MonitorSettings, MonitorSnapshot, RequesterHandle, RequesterSettings,
    VitalsMonitor, VitalsRequester,
};

// Connection
pub use infrastructure::connection::{
    ConnectionDriver, ConnectionHandle, ConnectionOptions, ConnectionState, ConnectionStatus,
    OverflowPolicy, Subscription,
};

// Transports
pub use infrastructure::transport::{
    MemoryBroker, MemoryTransport, PeerLink, WebSocketTransport, derive_socket_url,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, ConnectionSettings, CoverageGap, MonitorConfig, ServerSettings,
};

// Roster seed file
pub use infrastructure::roster::{RosterError, load_roster};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::{TopicClass, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
