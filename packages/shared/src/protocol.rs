//! Wire protocol for the socket connection.
//!
//! Every websocket text frame, in either direction, is one JSON
//! [`SocketFrame`]: an event name, positional arguments, and an optional
//! acknowledgement id. A frame carrying `ackId` expects exactly one reply
//! frame with `event == "ack"` and the same `ackId`, whose first argument is
//! the acknowledgement value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Event name reserved for acknowledgement replies.
pub const ACK_EVENT: &str = "ack";

/// Event names used on the socket, client to server.
pub mod client_events {
    pub const SEND_MAIN_CHAT_MESSAGE: &str = "sendMainChatMessage";
    pub const SEND_CHAT_MESSAGE: &str = "sendChatMessage";
    pub const SEND_START_TAROT_GAME: &str = "sendStartTarotGame";
    pub const SEND_AUDIO_REQUEST: &str = "sendAudioRequest";
}

/// Event names used on the socket, server to client.
pub mod server_events {
    pub const RECEIVE_CHAT_MESSAGE: &str = "receiveChatMessage";
    pub const RECEIVE_SERVER_STATUS_MESSAGE: &str = "receiveServerStatusMessage";
    pub const RECEIVE_TOAST_MESSAGE: &str = "receiveToastMessage";
    pub const RECEIVE_TAROT_CARD_FLIP: &str = "receiveTarotCardFlip";
    pub const RECEIVE_SITE_SETTINGS: &str = "receiveSiteSettings";
}

/// One event-named message on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketFrame {
    /// The name of the event.
    pub event: String,
    /// Positional arguments for the event.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Acknowledgement correlation id, when the sender expects a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
}

impl SocketFrame {
    /// Build a fire-and-forget frame.
    pub fn event(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            args,
            ack_id: None,
        }
    }

    /// Build a frame that expects an acknowledgement.
    pub fn request(event: impl Into<String>, args: Vec<Value>, ack_id: u64) -> Self {
        Self {
            event: event.into(),
            args,
            ack_id: Some(ack_id),
        }
    }

    /// Build the acknowledgement reply to a frame carrying `ack_id`.
    pub fn ack(ack_id: u64, value: Value) -> Self {
        Self {
            event: ACK_EVENT.to_string(),
            args: vec![value],
            ack_id: Some(ack_id),
        }
    }

    /// Whether this frame is an acknowledgement reply.
    pub fn is_ack(&self) -> bool {
        self.event == ACK_EVENT && self.ack_id.is_some()
    }

    /// Serialize this frame to the on-wire JSON text.
    pub fn to_wire(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialize)
    }

    /// Parse a frame from on-wire JSON text.
    pub fn from_wire(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Parse)
    }
}

/// Errors produced while encoding or decoding socket frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to serialize socket frame: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to parse socket frame: {0}")]
    Parse(#[source] serde_json::Error),
}
