//! Relay wire protocol.
//!
//! Frames are JSON objects tagged by a `type` field, matching what chat
//! clients exchange over the socket. Message content is always an opaque
//! envelope storage string by the time it reaches a frame; the relay
//! forwards it without the ability to decrypt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cipherchat_common::{Error, MessageId, Result, UserId};
use cipherchat_store::PresenceStatus;

/// Close code when an unauthenticated client connects.
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;

/// Close code when a client connects to a room it is not a member of.
pub const CLOSE_NOT_A_MEMBER: u16 = 4003;

fn default_message_type() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// An encrypted chat message. The relay never reads the content.
    Message {
        encrypted_content: String,
        #[serde(default)]
        sender_public_key: String,
        #[serde(default)]
        content_hash: String,
        #[serde(default = "default_message_type")]
        message_type: String,
    },
    /// Typing indicator.
    Typing {
        #[serde(default = "default_true")]
        is_typing: bool,
    },
    /// The client has read a message.
    ReadReceipt { message_id: MessageId },
    /// Forward a public key to another member for verification.
    KeyExchange {
        recipient_id: UserId,
        public_key: String,
    },
}

/// Frames the relay delivers to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// An encrypted message broadcast to the room.
    Message {
        message_id: MessageId,
        encrypted_content: String,
        sender_public_key: String,
        content_hash: String,
        message_type: String,
        sender_id: UserId,
        sender_username: String,
        timestamp: DateTime<Utc>,
    },
    /// A member joined the room.
    UserJoin {
        user_id: UserId,
        username: String,
        timestamp: DateTime<Utc>,
    },
    /// A member left the room.
    UserLeave {
        user_id: UserId,
        username: String,
        timestamp: DateTime<Utc>,
    },
    /// Someone is (or stopped) typing. Not delivered back to the typist.
    Typing {
        user_id: UserId,
        username: String,
        is_typing: bool,
    },
    /// A member read a message.
    ReadReceipt {
        message_id: MessageId,
        user_id: UserId,
        read_at: DateTime<Utc>,
    },
    /// A forwarded public key. Delivered only to its recipient.
    KeyExchange {
        sender_id: UserId,
        recipient_id: UserId,
        public_key: String,
    },
    /// Presence change broadcast.
    Presence {
        user_id: UserId,
        username: String,
        status: PresenceStatus,
    },
    /// An error local to the sending client.
    Error { message: String },
}

impl ServerFrame {
    /// Build an error frame.
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }
}

/// Parse a raw inbound text frame.
///
/// # Errors
/// - `Protocol` on malformed JSON or an unknown frame type
pub fn parse_client_frame(text: &str) -> Result<ClientFrame> {
    serde_json::from_str(text).map_err(|e| Error::Protocol(format!("Invalid frame: {}", e)))
}
