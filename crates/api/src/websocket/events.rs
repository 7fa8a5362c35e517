//! WebSocket frame types and serialization
//!
//! Every frame on the wire is `{"type": ..., "payload": {...}}`. Inbound
//! frames are decoded in two steps (envelope, then tag) so an unknown tag
//! and a bad payload produce distinct protocol errors.

use serde::{Deserialize, Deserializer, Serialize};
use supportdesk_shared::{ConversationId, ConversationStatus, MessageId, UserId};

use crate::chat::models::{AdminConversationState, Conversation, Message, UserProfile};

// =============================================================================
// Client-to-Server Frames
// =============================================================================

/// Frames sent from client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Join a conversation room
    Subscribe { conversation_id: ConversationId },

    /// Leave a conversation room
    Unsubscribe { conversation_id: ConversationId },

    /// Post a message into a joined conversation
    SendMessage {
        conversation_id: ConversationId,
        text: String,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ConversationPayload {
    #[serde(deserialize_with = "conversation_id")]
    conversation_id: ConversationId,
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    #[serde(deserialize_with = "conversation_id")]
    conversation_id: ConversationId,
    #[serde(default)]
    text: String,
}

/// Accepts `12` or `"12"`; ids must be positive
fn conversation_id<'de, D>(deserializer: D) -> Result<ConversationId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(i64),
        Text(String),
    }

    let id = match RawId::deserialize(deserializer)? {
        RawId::Number(n) => n,
        RawId::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom("invalid conversation ID"))?,
    };

    if id <= 0 {
        return Err(serde::de::Error::custom("invalid conversation ID"));
    }
    Ok(ConversationId(id))
}

impl ClientFrame {
    /// Decode one text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match envelope.kind.as_str() {
            "subscribe" => {
                let p: ConversationPayload = payload("subscribe", envelope.payload)?;
                Ok(Self::Subscribe {
                    conversation_id: p.conversation_id,
                })
            }
            "unsubscribe" => {
                let p: ConversationPayload = payload("unsubscribe", envelope.payload)?;
                Ok(Self::Unsubscribe {
                    conversation_id: p.conversation_id,
                })
            }
            "send_message" => {
                let p: SendMessagePayload = payload("send_message", envelope.payload)?;
                Ok(Self::SendMessage {
                    conversation_id: p.conversation_id,
                    text: p.text,
                })
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::SendMessage { .. } => "send_message",
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    value: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

/// Non-terminal decode failures, reported back as `error` frames
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    Malformed(String),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

// =============================================================================
// Server-to-Client Frames
// =============================================================================

/// Frames sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame after a successful upgrade
    Connected { user_id: UserId, message: String },

    Subscribed { conversation_id: ConversationId },

    Unsubscribed { conversation_id: ConversationId },

    /// Direct notification to the admin a new conversation was assigned to
    ConversationCreated(ConversationCreated),

    /// A customer's active conversation, pushed on connect
    ConversationLoaded {
        conversation_id: ConversationId,
        status: ConversationStatus,
    },

    MessageHistory {
        conversation_id: ConversationId,
        messages: Vec<Message>,
        count: usize,
    },

    /// Room broadcast of a saved message
    NewMessage(Message),

    /// Direct notification to the assigned admin about customer activity
    AdminNotification(AdminNotification),

    Error { error: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::ConversationCreated(_) => "conversation_created",
            Self::ConversationLoaded { .. } => "conversation_loaded",
            Self::MessageHistory { .. } => "message_history",
            Self::NewMessage(_) => "new_message",
            Self::AdminNotification(_) => "admin_notification",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationCreated {
    pub conversation: Conversation,
    pub customer: Option<UserProfile>,
    pub admin: Option<UserProfile>,
    pub admin_state: AdminConversationState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminNotification {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub unread_count: i32,
    pub sender_id: UserId,
    pub in_room: bool,
}
