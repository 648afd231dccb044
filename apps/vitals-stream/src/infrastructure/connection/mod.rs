//! Broker Connection
//!
//! One multiplexed link to the broker, shared by every local subscriber:
//!
//! - `manager`: the connection driver task and its cloneable handle
//! - `reconnect`: backoff schedule for unexpected closures
//! - `heartbeat`: dead-link detection while connected
//! - `outbound`: bounded FIFO for publishes made while disconnected

pub mod heartbeat;
mod manager;
pub mod outbound;
pub mod reconnect;

pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent, LinkActivity};
pub use manager::{
    ConnectionDriver, ConnectionHandle, ConnectionOptions, ConnectionState, ConnectionStatus,
    Subscription,
};
pub use outbound::{EnqueueOutcome, OutboundBuffer, OverflowPolicy, PendingMessage};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
