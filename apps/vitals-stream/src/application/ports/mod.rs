//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: establishes one full-duplex link to the message broker
//!
//! A link is a pair of channels. The connection driver pushes
//! [`OutboundFrame`]s into one and reads [`InboundFrame`]s from the other;
//! the adapter owns the socket and translates in both directions. Dropping
//! the outbound sender asks the adapter to close the socket.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

// =============================================================================
// Close Codes
// =============================================================================

/// Normal closure. Never triggers a reconnect.
pub const CLOSE_NORMAL: u16 = 1000;

/// Closure without a close frame (dropped socket, dead link).
pub const CLOSE_ABNORMAL: u16 = 1006;

// =============================================================================
// Credential
// =============================================================================

/// Opaque bearer token presented during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `Authorization` header value.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Frame sent from the connection driver to the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Register a literal topic with the broker.
    Subscribe {
        /// Topic to register.
        topic: String,
    },
    /// Release a literal topic.
    Unsubscribe {
        /// Topic to release.
        topic: String,
    },
    /// Publish a payload.
    Publish {
        /// Destination topic.
        topic: String,
        /// JSON body.
        payload: Value,
    },
    /// Keep-alive probe.
    Ping,
    /// Close the link.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Frame received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Text message carrying a JSON envelope.
    Text(String),
    /// Reply to a keep-alive probe.
    Pong,
    /// Publishes the transport accepted but never wrote, oldest first.
    /// Sent just before `Closed` when a link fails.
    Unsent(Vec<OutboundFrame>),
    /// Link closed by the remote side or the network.
    Closed {
        /// Close code (`1006` when no close frame was received).
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// An established link.
#[derive(Debug)]
pub struct TransportLink {
    /// Frames to send.
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    /// Frames received.
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

// =============================================================================
// Transport Port
// =============================================================================

/// Errors raised while establishing a link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Endpoint could not be turned into a request.
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint {
        /// Offending endpoint.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Socket or handshake failure.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Transport refused the attempt outright.
    #[error("connection refused")]
    Refused,
}

/// Broker transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish one link to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` when the socket or handshake fails.
    async fn connect(
        &self,
        endpoint: &str,
        credential: Option<&Credential>,
    ) -> Result<TransportLink, TransportError>;
}
