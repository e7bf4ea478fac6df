//! WebSocket protocol types for mychat
//!
//! Outbound frames are JSON objects tagged by `action`:
//! - `{"action":"heartbeat"}` keeps the connection alive
//! - `{"action":"chat_message","content":{...},"trace_id":"..."}` carries a chat message
//!
//! Inbound frames are not interpreted here; they are handed to the consumer
//! as parsed JSON when possible, raw text otherwise.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Liveness ping
    Heartbeat,

    /// Chat message to a user or group
    ChatMessage {
        content: ChatContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
    },
}

/// Body of a chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatContent {
    pub send_id: String,
    pub receiver_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    /// Client-generated id, echoed back in acks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// Chat payload kind, numeric on the wire (1 text, 2 image)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        match self {
            MessageKind::Text => 1,
            MessageKind::Image => 2,
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(MessageKind::Text),
            2 => Ok(MessageKind::Image),
            other => Err(serde::de::Error::custom(format!("unknown message type {other}"))),
        }
    }
}

impl ChatContent {
    pub fn new_text(send_id: impl Into<String>, receiver_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            send_id: send_id.into(),
            receiver_id: receiver_id.into(),
            kind: MessageKind::Text,
            content: text.into(),
            uuid: None,
        }
    }

    /// `url` is the location of an already uploaded image
    pub fn new_image(send_id: impl Into<String>, receiver_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Image,
            ..Self::new_text(send_id, receiver_id, url)
        }
    }

    /// Attach a freshly generated client message id
    pub fn with_client_id(mut self) -> Self {
        self.uuid = Some(uuid::Uuid::new_v4().to_string());
        self
    }
}

impl OutboundMessage {
    pub fn chat(content: ChatContent) -> Self {
        OutboundMessage::ChatMessage {
            content,
            trace_id: None,
        }
    }

    pub fn with_trace_id(self, id: impl Into<String>) -> Self {
        match self {
            OutboundMessage::ChatMessage { content, .. } => OutboundMessage::ChatMessage {
                content,
                trace_id: Some(id.into()),
            },
            other => other,
        }
    }
}

/// Inbound frame as delivered to the consumer
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    Json(Value),
    Raw(String),
}

impl InboundPayload {
    /// Parse as JSON, falling back to the raw text unchanged
    pub fn decode(text: &str) -> Self {
        match serde_json::from_str(text) {
            Ok(value) => InboundPayload::Json(value),
            Err(_) => InboundPayload::Raw(text.to_string()),
        }
    }

    pub fn decode_bytes(bytes: &[u8]) -> Self {
        match serde_json::from_slice(bytes) {
            Ok(value) => InboundPayload::Json(value),
            Err(_) => InboundPayload::Raw(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}
