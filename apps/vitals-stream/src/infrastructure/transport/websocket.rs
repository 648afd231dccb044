//! WebSocket Transport
//!
//! Each established link gets a pump task that owns the socket: it encodes
//! [`OutboundFrame`]s into JSON envelopes and turns socket traffic into
//! [`InboundFrame`]s. The bearer credential travels in the handshake's
//! `Authorization` header.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{
    CLOSE_ABNORMAL, Credential, InboundFrame, OutboundFrame, Transport, TransportError,
    TransportLink,
};
use crate::infrastructure::codec::{CodecError, EnvelopeCodec};

/// Close frame without a status code.
const CLOSE_NO_STATUS: u16 = 1005;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Derive the socket endpoint from the REST base URL.
///
/// `http` becomes `ws` and `https` becomes `wss`. A trailing `/api`
/// segment is replaced by `/ws`; otherwise `/ws` is appended.
///
/// # Errors
///
/// Returns `TransportError::InvalidEndpoint` for unsupported schemes.
pub fn derive_socket_url(base_url: &str) -> Result<String, TransportError> {
    let trimmed = base_url.trim().trim_end_matches('/');

    let socket_base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        return Err(TransportError::InvalidEndpoint {
            endpoint: base_url.to_string(),
            reason: "expected an http, https, ws or wss URL".to_string(),
        });
    };

    let root = socket_base.strip_suffix("/api").unwrap_or(&socket_base);
    Ok(format!("{root}/ws"))
}

/// `tokio-tungstenite` transport.
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport {
    codec: EnvelopeCodec,
}

impl WebSocketTransport {
    /// Create a new transport.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            codec: EnvelopeCodec::new(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        endpoint: &str,
        credential: Option<&Credential>,
    ) -> Result<TransportLink, TransportError> {
        let invalid = |reason: String| TransportError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason,
        };

        let mut request = endpoint
            .into_client_request()
            .map_err(|e| invalid(e.to_string()))?;
        if let Some(credential) = credential {
            let value = HeaderValue::from_str(&credential.bearer())
                .map_err(|_| invalid("credential is not a valid header value".to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        tracing::debug!(endpoint, "Opening WebSocket");
        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(socket, outbound_rx, inbound_tx, self.codec.clone()));

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

fn encode(codec: &EnvelopeCodec, frame: OutboundFrame) -> Result<Message, CodecError> {
    let message = match frame {
        OutboundFrame::Subscribe { topic } => Message::Text(codec.encode_subscribe(&topic)?.into()),
        OutboundFrame::Unsubscribe { topic } => {
            Message::Text(codec.encode_unsubscribe(&topic)?.into())
        }
        OutboundFrame::Publish { topic, payload } => {
            Message::Text(codec.encode_publish(&topic, &payload)?.into())
        }
        OutboundFrame::Ping => Message::Ping(Vec::new().into()),
        OutboundFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    };
    Ok(message)
}

/// Report a failed link: unsent publishes first, then the closure.
fn report_closed(
    inbound: &mpsc::UnboundedSender<InboundFrame>,
    outbound: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    failed: Option<OutboundFrame>,
    code: u16,
    reason: String,
) {
    let unsent = drain_unsent(outbound, failed);
    if !unsent.is_empty() {
        tracing::debug!(count = unsent.len(), "Returning unsent publishes");
        let _ = inbound.send(InboundFrame::Unsent(unsent));
    }
    let _ = inbound.send(InboundFrame::Closed { code, reason });
}

/// Close the outbound queue and collect the publishes still in it, after
/// the one whose write failed.
fn drain_unsent(
    outbound: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    failed: Option<OutboundFrame>,
) -> Vec<OutboundFrame> {
    outbound.close();
    failed
        .into_iter()
        .chain(std::iter::from_fn(|| outbound.try_recv().ok()))
        .filter(|frame| matches!(frame, OutboundFrame::Publish { .. }))
        .collect()
}

async fn pump(
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    codec: EnvelopeCodec,
) {
    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // Driver dropped the link.
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                let closing = matches!(frame, OutboundFrame::Close { .. });
                let retained = matches!(frame, OutboundFrame::Publish { .. }).then(|| frame.clone());
                let message = match encode(&codec, frame) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode outbound frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(message).await {
                    tracing::warn!(error = %e, "WebSocket write failed");
                    report_closed(&inbound, &mut outbound, retained, CLOSE_ABNORMAL, e.to_string());
                    break;
                }
                if closing {
                    break;
                }
            }
            message = read.next() => {
                let frame = match message {
                    Some(Ok(Message::Text(text))) => InboundFrame::Text(text.to_string()),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => InboundFrame::Text(text),
                        Err(_) => {
                            tracing::warn!(len = bytes.len(), "Non-UTF-8 binary frame dropped");
                            continue;
                        }
                    },
                    Some(Ok(Message::Pong(_))) => InboundFrame::Pong,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(close))) => {
                        let (code, reason) = close.map_or_else(
                            || (CLOSE_NO_STATUS, String::new()),
                            |frame| (u16::from(frame.code), frame.reason.to_string()),
                        );
                        report_closed(&inbound, &mut outbound, None, code, reason);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Err(e)) => {
                        report_closed(&inbound, &mut outbound, None, CLOSE_ABNORMAL, e.to_string());
                        break;
                    }
                    None => {
                        report_closed(
                            &inbound,
                            &mut outbound,
                            None,
                            CLOSE_ABNORMAL,
                            "stream ended".to_string(),
                        );
                        break;
                    }
                };
                if inbound.send(frame).is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("WebSocket pump stopped");
}
