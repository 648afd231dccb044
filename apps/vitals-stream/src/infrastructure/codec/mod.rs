//! Envelope Codec
//!
//! JSON envelopes exchanged with the broker.
//!
//! Outbound publish:
//! ```json
//! {"destination":"/app/vitals","body":"{\"heartRate\":80}","headers":{"content-type":"application/json"}}
//! ```
//!
//! Outbound registration frames carry a `command` (`SUBSCRIBE` or
//! `UNSUBSCRIBE`) and no body.
//!
//! Inbound messages name their topic in `topic` (or `destination`). The
//! payload is `body` (a string body is parsed again), else `data`, else
//! the whole object.

use serde::Serialize;
use serde_json::Value;

use crate::domain::subscription::InboundMessage;

const CONTENT_TYPE_JSON: &str = "application/json";

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Inner `body` string is not valid JSON.
    #[error("malformed body on {topic}: {source}")]
    MalformedBody {
        /// Topic the message arrived on.
        topic: String,
        /// Parse failure.
        source: serde_json::Error,
    },

    /// Invalid envelope shape.
    #[error("invalid envelope: {0}")]
    InvalidFormat(String),
}

#[derive(Debug, Serialize)]
struct Headers {
    #[serde(rename = "content-type")]
    content_type: &'static str,
}

#[derive(Debug, Serialize)]
struct OutboundEnvelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'static str>,
    destination: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    headers: Headers,
}

impl<'a> OutboundEnvelope<'a> {
    const fn new(destination: &'a str) -> Self {
        Self {
            command: None,
            destination,
            body: None,
            headers: Headers {
                content_type: CONTENT_TYPE_JSON,
            },
        }
    }
}

/// JSON envelope codec.
#[derive(Debug, Default, Clone)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode an inbound text frame.
    ///
    /// Returns `Ok(None)` for envelopes that name no topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object or its string
    /// `body` is not valid JSON.
    pub fn decode(&self, text: &str) -> Result<Option<InboundMessage>, CodecError> {
        let value: Value = serde_json::from_str(text.trim())?;
        let Some(object) = value.as_object() else {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}",
                json_kind(&value)
            )));
        };

        let topic = ["topic", "destination"]
            .iter()
            .filter_map(|key| object.get(*key).and_then(Value::as_str))
            .find(|topic| !topic.is_empty());
        let Some(topic) = topic else {
            return Ok(None);
        };

        let payload = match object.get("body") {
            Some(Value::String(body)) if !body.is_empty() => {
                serde_json::from_str(body).map_err(|source| CodecError::MalformedBody {
                    topic: topic.to_string(),
                    source,
                })?
            }
            Some(body) if is_present(body) => body.clone(),
            _ => match object.get("data") {
                Some(data) if is_present(data) => data.clone(),
                _ => value.clone(),
            },
        };

        Ok(Some(InboundMessage::new(topic, payload)))
    }

    /// Encode a publish frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_publish(&self, topic: &str, payload: &Value) -> Result<String, CodecError> {
        let envelope = OutboundEnvelope {
            body: Some(serde_json::to_string(payload)?),
            ..OutboundEnvelope::new(topic)
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Encode a topic registration frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_subscribe(&self, topic: &str) -> Result<String, CodecError> {
        self.encode_command("SUBSCRIBE", topic)
    }

    /// Encode a topic release frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_unsubscribe(&self, topic: &str) -> Result<String, CodecError> {
        self.encode_command("UNSUBSCRIBE", topic)
    }

    fn encode_command(&self, command: &'static str, topic: &str) -> Result<String, CodecError> {
        let envelope = OutboundEnvelope {
            command: Some(command),
            ..OutboundEnvelope::new(topic)
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
