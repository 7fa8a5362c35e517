//! Persistence contract for conversations, messages, and admin bookkeeping
//!
//! Counters and unread state are only ever changed through the atomic
//! primitives below so concurrent create/close/send never lose updates.

use async_trait::async_trait;
use supportdesk_shared::{ConversationId, MessageId, StoreResult, UserId};
use time::OffsetDateTime;

use super::models::{
    AdminAvailability, AdminConversationState, Conversation, MessagePage, NewAssignment,
    SavedMessage, UserProfile, Visibility,
};

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Cheap round trip used by readiness checks
    async fn ping(&self) -> StoreResult<()>;

    async fn get_user(&self, id: UserId) -> StoreResult<Option<UserProfile>>;

    // -------------------------------------------------------------------------
    // Conversations
    // -------------------------------------------------------------------------

    async fn get_conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>>;

    /// Atomically insert an open conversation assigned to `admin_id`, add one
    /// to the admin's load and create their zeroed unread row. Nothing is
    /// written if any step fails.
    async fn create_assigned_conversation(
        &self,
        customer_id: UserId,
        admin_id: UserId,
    ) -> StoreResult<NewAssignment>;

    /// The customer's newest open conversation
    async fn find_open_conversation(&self, customer_id: UserId)
        -> StoreResult<Option<Conversation>>;

    async fn list_customer_conversations(&self, customer_id: UserId)
        -> StoreResult<Vec<Conversation>>;

    /// Conversations assigned to `admin_id`, optionally only the open ones
    async fn list_admin_conversations(
        &self,
        admin_id: UserId,
        open_only: bool,
    ) -> StoreResult<Vec<Conversation>>;

    /// Atomically move open -> closed, soft-delete every message with
    /// `purge_at`, and decrement the admin's load (never below zero).
    /// Returns `None` when the conversation was not open.
    async fn close_conversation(
        &self,
        id: ConversationId,
        purge_at: OffsetDateTime,
    ) -> StoreResult<Option<Conversation>>;

    /// Atomically clear `purge_at` on the conversation's messages (leaving
    /// `deleted_at`) and move closed -> open, incrementing the admin's load.
    /// Returns `None` when the conversation was not closed; purge deadlines are
    /// cleared either way.
    async fn reopen_conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>>;

    // -------------------------------------------------------------------------
    // Admin load
    // -------------------------------------------------------------------------

    /// Admin with the fewest open conversations, lowest id on ties. Admins
    /// without an availability row count as zero.
    async fn least_busy_admin(&self) -> StoreResult<Option<AdminAvailability>>;

    async fn admin_availability(&self, admin_id: UserId) -> StoreResult<Option<AdminAvailability>>;

    // -------------------------------------------------------------------------
    // Admin conversation state
    // -------------------------------------------------------------------------

    async fn get_admin_state(
        &self,
        admin_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<Option<AdminConversationState>>;

    /// Add one unread message, creating the row if needed
    async fn increment_unread(
        &self,
        admin_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<AdminConversationState>;

    /// Zero the unread count and advance last-seen. `None` if no row exists.
    async fn reset_unread(
        &self,
        admin_id: UserId,
        conversation_id: ConversationId,
        last_message_id: Option<MessageId>,
    ) -> StoreResult<Option<AdminConversationState>>;

    async fn list_admin_states(&self, admin_id: UserId) -> StoreResult<Vec<AdminConversationState>>;

    // -------------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------------

    /// Insert a message and stamp the conversation's `last_message_at`.
    ///
    /// Serialized against close: a closed conversation is reopened (as
    /// [`ChatStore::reopen_conversation`]) in the same atomic step before the
    /// insert, so a message never lands in a closed conversation.
    /// `StoreError::NotFound` if the conversation does not exist.
    async fn save_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        text: &str,
    ) -> StoreResult<SavedMessage>;

    /// Page of messages older than `cursor`, ascending. `limit` is already clamped.
    async fn message_history(
        &self,
        conversation_id: ConversationId,
        limit: i64,
        cursor: Option<MessageId>,
        visibility: Visibility,
    ) -> StoreResult<MessagePage>;

    /// Newest message id, soft-deleted messages included
    async fn latest_message_id(&self, conversation_id: ConversationId)
        -> StoreResult<Option<MessageId>>;

    /// Permanently delete messages whose purge deadline is at or before `now`
    async fn purge_expired(&self, now: OffsetDateTime) -> StoreResult<u64>;
}
