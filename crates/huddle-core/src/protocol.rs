//! JSON frames exchanged over the socket.
//!
//! Inbound frames are adjacently tagged:
//! `{"type":"join","payload":{"roomId":"…"}}` and
//! `{"type":"chat","payload":{"message":"…"}}`. Payload fields are optional
//! on the wire; the router decides what an absent or empty field means.
//!
//! Outbound frames are flat:
//! `{"type":"chat","message":"…","timestamp":"…","roomId":"…"}`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::ids::RoomId;

/// A decoded client frame.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum InboundMessage {
    Join(JoinPayload),
    Chat(ChatPayload),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(default)]
    pub room_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub message: Option<String>,
}

impl InboundMessage {
    pub fn join(room_id: impl Into<String>) -> Self {
        Self::Join(JoinPayload {
            room_id: Some(room_id.into()),
        })
    }

    pub fn chat(message: impl Into<String>) -> Self {
        Self::Chat(ChatPayload {
            message: Some(message.into()),
        })
    }

    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Chat(_) => "chat",
        }
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Decode)
    }

    /// Binary frames carry the same JSON as text frames.
    pub fn decode_bytes(raw: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(raw)?;
        Self::decode(text)
    }
}

/// A frame pushed to a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Chat(ChatDelivery),
}

/// One chat line as seen by a recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDelivery {
    pub message: String,
    pub timestamp: String,
    pub room_id: RoomId,
}

impl OutboundMessage {
    pub fn chat(message: impl Into<String>, room_id: RoomId, at: DateTime<Utc>) -> Self {
        Self::Chat(ChatDelivery {
            message: message.into(),
            timestamp: format_timestamp(at),
            room_id,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// ISO-8601, UTC, millisecond precision, `Z` suffix.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
