//! Chat domain records

use serde::{Deserialize, Serialize};
use supportdesk_shared::{ConversationId, ConversationStatus, MessageId, Role, UserId};
use time::OffsetDateTime;

/// Default and maximum page sizes for message history
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 100;

/// A customer/admin conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub customer_id: UserId,
    /// Assigned at creation, `None` only for rows whose admin was removed
    pub admin_id: Option<UserId>,
    pub status: ConversationStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Conversation {
    pub fn is_closed(&self) -> bool {
        self.status == ConversationStatus::Closed
    }

    /// Customer or assigned admin
    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.customer_id == user_id || self.admin_id == Some(user_id)
    }

    /// Admins may access every conversation; everyone else must participate
    pub fn can_access(&self, user_id: UserId, role: Role) -> bool {
        role.is_admin() || self.is_participant(user_id)
    }
}

/// Conversation row as listed over REST. Admin listings carry the customer's
/// profile; customer listings leave those fields out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_role: Option<Role>,
}

impl ConversationSummary {
    pub fn with_customer(conversation: Conversation, customer: Option<&UserProfile>) -> Self {
        Self {
            conversation,
            customer_name: customer.map(|c| c.username.clone()),
            customer_email: customer.map(|c| c.email.clone()),
            customer_role: customer.map(|c| c.role),
        }
    }
}

impl From<Conversation> for ConversationSummary {
    fn from(conversation: Conversation) -> Self {
        Self::with_customer(conversation, None)
    }
}

/// Everything written when a conversation is opened and assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAssignment {
    pub conversation: Conversation,
    pub admin_load: AdminAvailability,
    pub admin_state: AdminConversationState,
}

/// A stored message, plus the conversation when storing it had to reopen it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedMessage {
    pub message: Message,
    pub reopened: Option<Conversation>,
}

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(rename = "message_text")]
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub purge_at: Option<OffsetDateTime>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Open-conversation load of an admin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAvailability {
    pub admin_id: UserId,
    pub current_conversations: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Per-admin unread bookkeeping for one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminConversationState {
    pub admin_id: UserId,
    pub conversation_id: ConversationId,
    pub unread_count: i32,
    pub last_message_id: Option<MessageId>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Public profile used to enrich notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub role: Role,
}

/// Which messages a history read may see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Soft-deleted messages hidden
    Public,
    /// Soft-deleted messages included
    All,
}

impl Visibility {
    pub fn for_role(role: Role) -> Self {
        if role.is_admin() {
            Self::All
        } else {
            Self::Public
        }
    }
}

/// One page of message history, ascending by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Pass back as `cursor` for the next older page; `None` on the last page
    pub next_cursor: Option<MessageId>,
    pub limit: i64,
}

/// Clamp a requested page size: missing or non-positive -> default, above max -> max
pub fn normalize_limit(limit: Option<i64>) -> i64 {
    match limit {
        Some(l) if l > MAX_HISTORY_LIMIT => MAX_HISTORY_LIMIT,
        Some(l) if l > 0 => l,
        _ => DEFAULT_HISTORY_LIMIT,
    }
}

/// Build a page from rows fetched newest-first with `limit + 1` rows requested
pub fn page_from_newest_first(mut rows: Vec<Message>, limit: i64) -> MessagePage {
    let limit_usize = usize::try_from(limit).unwrap_or(0);
    let has_more = rows.len() > limit_usize;
    rows.truncate(limit_usize);

    let next_cursor = if has_more {
        rows.last().map(|m| m.id)
    } else {
        None
    };

    rows.reverse();
    MessagePage {
        messages: rows,
        next_cursor,
        limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: i64) -> Message {
        Message {
            id: MessageId(id),
            conversation_id: ConversationId(1),
            sender_id: UserId(1),
            text: format!("m{id}"),
            created_at: OffsetDateTime::UNIX_EPOCH,
            deleted_at: None,
            purge_at: None,
        }
    }

    #[test]
    fn test_normalize_limit() {
        assert_eq!(normalize_limit(None), 50);
        assert_eq!(normalize_limit(Some(0)), 50);
        assert_eq!(normalize_limit(Some(-3)), 50);
        assert_eq!(normalize_limit(Some(1)), 1);
        assert_eq!(normalize_limit(Some(100)), 100);
        assert_eq!(normalize_limit(Some(250)), 100);
    }

    #[test]
    fn test_page_with_more_rows() {
        let rows = vec![message(10), message(9), message(8), message(7)];
        let page = page_from_newest_first(rows, 3);

        let ids: Vec<i64> = page.messages.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![8, 9, 10]);
        assert_eq!(page.next_cursor, Some(MessageId(8)));
    }

    #[test]
    fn test_last_page_has_no_cursor() {
        let rows = vec![message(2), message(1)];
        let page = page_from_newest_first(rows, 3);

        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn test_message_serializes_text_as_message_text() {
        let json = serde_json::to_value(message(5)).unwrap_or_default();
        assert_eq!(json["message_text"], "m5");
        assert!(json["deleted_at"].is_null());
    }

    #[test]
    fn test_conversation_access() {
        let conversation = Conversation {
            id: ConversationId(1),
            customer_id: UserId(10),
            admin_id: Some(UserId(20)),
            status: ConversationStatus::Open,
            last_message_at: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        };

        assert!(conversation.can_access(UserId(10), Role::Customer));
        assert!(conversation.can_access(UserId(20), Role::Admin));
        assert!(conversation.can_access(UserId(99), Role::Admin));
        assert!(!conversation.can_access(UserId(99), Role::Customer));
        assert!(!conversation.can_access(UserId(99), Role::Seller));
    }
}
