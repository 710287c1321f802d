//! WebSocket message types and the JSON envelope used by rooms and the hub.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;

/// Standard close status codes (RFC 6455 section 7.4.1).
pub mod close_code {
    /// Normal closure
    pub const NORMAL_CLOSURE: u16 = 1000;
    /// Endpoint is going away (server shutdown, page navigation)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Received a data type that cannot be accepted
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Message violates the server policy
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too big to process
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Unexpected server condition
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Message type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Text message
    Text,
    /// Binary message
    Binary,
    /// Ping message
    Ping,
    /// Pong message
    Pong,
    /// Close message
    Close,
}

/// A WebSocket message.
///
/// For close messages the payload follows the wire layout: two bytes of
/// big-endian status code followed by the UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The message type
    pub message_type: MessageType,
    /// The message payload
    pub payload: Bytes,
}

impl Message {
    /// Create a new text message.
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self {
            message_type: MessageType::Text,
            payload: Bytes::from(text.into()),
        }
    }

    /// Create a new binary message.
    pub fn binary<B: Into<Bytes>>(data: B) -> Self {
        Self {
            message_type: MessageType::Binary,
            payload: data.into(),
        }
    }

    /// Create a new ping message.
    pub fn ping<B: Into<Bytes>>(data: B) -> Self {
        Self {
            message_type: MessageType::Ping,
            payload: data.into(),
        }
    }

    /// Create a new pong message.
    pub fn pong<B: Into<Bytes>>(data: B) -> Self {
        Self {
            message_type: MessageType::Pong,
            payload: data.into(),
        }
    }

    /// Create a close message without a status.
    pub fn close() -> Self {
        Self {
            message_type: MessageType::Close,
            payload: Bytes::new(),
        }
    }

    /// Create a close message carrying a status code and reason.
    pub fn close_with(code: u16, reason: &str) -> Self {
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(code);
        buf.put_slice(reason.as_bytes());
        Self {
            message_type: MessageType::Close,
            payload: buf.freeze(),
        }
    }

    /// Create a JSON text message from a serializable value.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(value)?;
        Ok(Self::text(json))
    }

    /// Create a `{"type": event, "data": data}` envelope message.
    pub fn envelope<T: Serialize + ?Sized>(
        event: &str,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        #[derive(Serialize)]
        struct EnvelopeRef<'a, T: Serialize + ?Sized> {
            #[serde(rename = "type")]
            event: &'a str,
            data: &'a T,
        }

        Self::json(&EnvelopeRef { event, data })
    }

    /// Parse the message payload as JSON.
    pub fn parse_json<'a, T: Deserialize<'a>>(&'a self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Parse the payload as an [`Envelope`] with a non-empty `type`.
    ///
    /// Returns `None` for control frames, non-JSON payloads and envelopes
    /// with an empty type.
    pub fn as_envelope(&self) -> Option<Envelope> {
        if !self.is_text() && !self.is_binary() {
            return None;
        }
        let envelope: Envelope = serde_json::from_slice(&self.payload).ok()?;
        (!envelope.event.is_empty()).then_some(envelope)
    }

    /// Get the message payload as a string.
    pub fn as_text(&self) -> Option<&str> {
        if self.message_type == MessageType::Text {
            std::str::from_utf8(&self.payload).ok()
        } else {
            None
        }
    }

    /// Get the message payload as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Status code of a close message, if present.
    pub fn close_code(&self) -> Option<u16> {
        if !self.is_close() || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Reason text of a close message.
    pub fn close_reason(&self) -> Option<&str> {
        self.close_code()?;
        std::str::from_utf8(&self.payload[2..]).ok()
    }

    /// Check if this is a text message.
    pub fn is_text(&self) -> bool {
        self.message_type == MessageType::Text
    }

    /// Check if this is a binary message.
    pub fn is_binary(&self) -> bool {
        self.message_type == MessageType::Binary
    }

    /// Check if this is a ping message.
    pub fn is_ping(&self) -> bool {
        self.message_type == MessageType::Ping
    }

    /// Check if this is a pong message.
    pub fn is_pong(&self) -> bool {
        self.message_type == MessageType::Pong
    }

    /// Check if this is a close message.
    pub fn is_close(&self) -> bool {
        self.message_type == MessageType::Close
    }

    /// Length of the payload in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::binary(data)
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Self::binary(data)
    }
}

impl From<tungstenite::Message> for Message {
    fn from(msg: tungstenite::Message) -> Self {
        match msg {
            tungstenite::Message::Text(text) => Self::text(text.as_str()),
            tungstenite::Message::Binary(data) => Self::binary(data),
            tungstenite::Message::Ping(data) => Self::ping(data),
            tungstenite::Message::Pong(data) => Self::pong(data),
            tungstenite::Message::Close(Some(frame)) => {
                Self::close_with(u16::from(frame.code), frame.reason.as_str())
            }
            tungstenite::Message::Close(None) => Self::close(),
            tungstenite::Message::Frame(_) => Self::binary(Bytes::new()),
        }
    }
}

impl From<Message> for tungstenite::Message {
    fn from(msg: Message) -> Self {
        match msg.message_type {
            MessageType::Text => tungstenite::Message::Text(
                String::from_utf8_lossy(&msg.payload).into_owned().into(),
            ),
            MessageType::Binary => tungstenite::Message::Binary(msg.payload),
            MessageType::Ping => tungstenite::Message::Ping(msg.payload),
            MessageType::Pong => tungstenite::Message::Pong(msg.payload),
            MessageType::Close => {
                let frame = msg.close_code().map(|code| CloseFrame {
                    code: CloseCode::from(code),
                    reason: msg.close_reason().unwrap_or_default().to_owned().into(),
                });
                tungstenite::Message::Close(frame)
            }
        }
    }
}

/// JSON application message: `{"type": string, "data": <json>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name
    #[serde(rename = "type")]
    pub event: String,
    /// Event payload
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Build an envelope from any serializable payload.
    pub fn new<T: Serialize>(event: impl Into<String>, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Deserialize the payload into a concrete type.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}
