//! In-Memory Transport
//!
//! Hands every accepted link to a [`MemoryBroker`], which plays the remote
//! side: it reads the frames the driver sends and injects inbound traffic.
//! Used by the integration tests and for running the pipeline without a
//! network.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::application::ports::{
    Credential, InboundFrame, OutboundFrame, Transport, TransportError, TransportLink,
};

#[derive(Debug, Default)]
struct BrokerState {
    connect_calls: usize,
    refuse_remaining: usize,
}

/// Client side of the in-memory broker.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<BrokerState>>,
    accepted: mpsc::UnboundedSender<PeerLink>,
}

/// Remote side of the in-memory broker.
#[derive(Debug)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    accepted: mpsc::UnboundedReceiver<PeerLink>,
}

impl MemoryTransport {
    /// Create a transport and the broker that receives its links.
    #[must_use]
    pub fn new() -> (Self, MemoryBroker) {
        let state = Arc::new(Mutex::new(BrokerState::default()));
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::clone(&state),
                accepted: accepted_tx,
            },
            MemoryBroker {
                state,
                accepted: accepted_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        endpoint: &str,
        credential: Option<&Credential>,
    ) -> Result<TransportLink, TransportError> {
        {
            let mut state = self.state.lock();
            state.connect_calls += 1;
            if state.refuse_remaining > 0 {
                state.refuse_remaining -= 1;
                return Err(TransportError::Refused);
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let peer = PeerLink {
            endpoint: endpoint.to_string(),
            credential: credential.cloned(),
            frames: outbound_rx,
            events: inbound_tx,
        };
        self.accepted
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed("broker is gone".to_string()))?;

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

impl MemoryBroker {
    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.state.lock().refuse_remaining = count;
    }

    /// Total `connect` calls seen, refused ones included.
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    /// Wait for the next accepted link.
    pub async fn accept(&mut self) -> Option<PeerLink> {
        self.accepted.recv().await
    }

    /// Take an accepted link without waiting.
    pub fn try_accept(&mut self) -> Option<PeerLink> {
        self.accepted.try_recv().ok()
    }
}

/// Broker end of one link.
#[derive(Debug)]
pub struct PeerLink {
    /// Endpoint the client dialled.
    pub endpoint: String,
    /// Credential presented during the handshake.
    pub credential: Option<Credential>,
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
    events: mpsc::UnboundedSender<InboundFrame>,
}

impl PeerLink {
    /// Next frame from the client; `None` once the client dropped the link.
    pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
        self.frames.recv().await
    }

    /// Everything the client has sent so far.
    pub fn drain_frames(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Deliver a raw text frame. Returns `false` if the client is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.events.send(InboundFrame::Text(text.into())).is_ok()
    }

    /// Deliver a message envelope for `topic` with a JSON-string body.
    pub fn send_message(&self, topic: &str, payload: &Value) -> bool {
        let envelope = json!({ "destination": topic, "body": payload.to_string() });
        self.send_text(envelope.to_string())
    }

    /// Answer a ping.
    pub fn send_pong(&self) -> bool {
        self.events.send(InboundFrame::Pong).is_ok()
    }

    /// Close the link from the broker side.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.events
            .send(InboundFrame::Closed {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }

    /// Fail the link the way a dropped socket does: publishes the client
    /// sent but this side never read go back to it, then the link closes.
    pub fn abort(&mut self, code: u16, reason: &str) -> bool {
        self.frames.close();
        let unsent: Vec<_> = self
            .drain_frames()
            .into_iter()
            .filter(|frame| matches!(frame, OutboundFrame::Publish { .. }))
            .collect();
        if !unsent.is_empty() && self.events.send(InboundFrame::Unsent(unsent)).is_err() {
            return false;
        }
        self.close(code, reason)
    }
}
