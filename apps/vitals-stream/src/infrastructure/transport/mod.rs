//! Transport Adapters
//!
//! Implementations of the [`Transport`](crate::application::ports::Transport)
//! port:
//!
//! - `websocket`: JSON envelopes over a `tokio-tungstenite` socket
//! - `memory`: in-process link pairs for tests and local wiring

pub mod memory;
pub mod websocket;

pub use memory::{MemoryBroker, MemoryTransport, PeerLink};
pub use websocket::{WebSocketTransport, derive_socket_url};
