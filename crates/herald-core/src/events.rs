use serde::{Deserialize, Serialize};

use crate::ids::ConversationId;
use crate::message::{MediaType, MessageRecord};
use crate::presence::PresenceKind;

/// Frames a client may send after the connection is established.
/// Wire shape: `{"event": "<name>", "data": <payload>}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// First frame on the socket unless a bearer header was supplied at
    /// upgrade time.
    Auth { token: String },

    /// Manual room join; the payload is the bare conversation id.
    Join(ConversationId),

    #[serde(rename_all = "camelCase")]
    SendMessage {
        conversation_id: ConversationId,
        content: Option<String>,
        media_url: Option<String>,
        media_type: Option<MediaType>,
    },

    TypingStart(ConversationId),
    TypingStop(ConversationId),
}

impl ClientEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Join(_) => "join",
            Self::SendMessage { .. } => "send_message",
            Self::TypingStart(_) => "typing_start",
            Self::TypingStop(_) => "typing_stop",
        }
    }
}

/// Frames the server emits. Same envelope as [`ClientEvent`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Authenticated { user_id: String, name: String },

    /// Fan-out of a persisted message to every session in the room,
    /// the sender's own sessions included.
    NewMessage(MessageRecord),

    /// Reply to the sending session only, carrying the persisted record.
    MessageSent(MessageRecord),

    #[serde(rename_all = "camelCase")]
    UserTyping {
        user_id: String,
        user_name: String,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    UserStatusChanged {
        user_id: String,
        status: PresenceKind,
    },

    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::NewMessage(_) => "new_message",
            Self::MessageSent(_) => "message_sent",
            Self::UserTyping { .. } => "user_typing",
            Self::UserStatusChanged { .. } => "user_status_changed",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_authorized(message: impl Into<String>) -> Self {
        Self::error("not_authorized", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::error("not_found", message)
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::error("store_unavailable", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::error("bad_request", message)
    }
}
