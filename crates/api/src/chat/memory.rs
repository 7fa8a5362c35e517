//! In-process [`ChatStore`] for tests and database-less local runs
//!
//! Every operation runs under one mutex, so multi-step updates (create,
//! close, reopen, send, purge) are atomic with respect to each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use supportdesk_shared::{
    ConversationId, ConversationStatus, MessageId, Role, StoreError, StoreResult, UserId,
};
use time::OffsetDateTime;

use super::models::{
    page_from_newest_first, AdminAvailability, AdminConversationState, Conversation, Message,
    MessagePage, NewAssignment, SavedMessage, UserProfile, Visibility,
};
use super::store::ChatStore;

#[derive(Default)]
struct MemoryState {
    users: BTreeMap<UserId, UserProfile>,
    conversations: BTreeMap<ConversationId, Conversation>,
    availability: HashMap<UserId, AdminAvailability>,
    states: HashMap<(UserId, ConversationId), AdminConversationState>,
    messages: BTreeMap<MessageId, Message>,
    next_user_id: i64,
    next_conversation_id: i64,
    next_message_id: i64,
}

impl MemoryState {
    fn adjust_load(&mut self, admin_id: UserId, delta: i32) -> AdminAvailability {
        let now = OffsetDateTime::now_utc();
        let entry = self
            .availability
            .entry(admin_id)
            .or_insert_with(|| AdminAvailability {
                admin_id,
                current_conversations: 0,
                updated_at: now,
            });
        // Conditional decrement: never below zero
        entry.current_conversations = (entry.current_conversations + delta).max(0);
        entry.updated_at = now;
        entry.clone()
    }

    fn state_entry(
        &mut self,
        admin_id: UserId,
        conversation_id: ConversationId,
    ) -> &mut AdminConversationState {
        self.states
            .entry((admin_id, conversation_id))
            .or_insert_with(|| AdminConversationState {
                admin_id,
                conversation_id,
                unread_count: 0,
                last_message_id: None,
                updated_at: OffsetDateTime::now_utc(),
            })
    }

    /// Clear purge deadlines, then closed -> open with the load bump
    fn reopen(&mut self, id: ConversationId) -> Option<Conversation> {
        for message in self.messages.values_mut().filter(|m| m.conversation_id == id) {
            message.purge_at = None;
        }

        let reopened = match self.conversations.get_mut(&id) {
            Some(conversation) if conversation.is_closed() => {
                conversation.status = ConversationStatus::Open;
                conversation.updated_at = OffsetDateTime::now_utc();
                conversation.clone()
            }
            _ => return None,
        };

        if let Some(admin_id) = reopened.admin_id {
            self.adjust_load(admin_id, 1);
        }
        Some(reopened)
    }
}

#[derive(Default)]
pub struct MemoryChatStore {
    state: Mutex<MemoryState>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a user, as the ticketing system would
    pub fn insert_user(&self, username: &str, role: Role) -> UserProfile {
        let mut state = self.lock();
        state.next_user_id += 1;
        let profile = UserProfile {
            id: UserId(state.next_user_id),
            username: username.to_string(),
            email: format!("{username}@example.com"),
            role,
        };
        state.users.insert(profile.id, profile.clone());
        profile
    }

    /// Overwrite an admin's open-conversation count
    pub fn set_admin_load(&self, admin_id: UserId, current_conversations: i32) {
        let mut state = self.lock();
        state.availability.insert(
            admin_id,
            AdminAvailability {
                admin_id,
                current_conversations,
                updated_at: OffsetDateTime::now_utc(),
            },
        );
    }

    /// Raw message lookup, soft-deleted included
    pub fn message(&self, id: MessageId) -> Option<Message> {
        self.lock().messages.get(&id).cloned()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> StoreResult<Option<UserProfile>> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn get_conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        Ok(self.lock().conversations.get(&id).cloned())
    }

    async fn create_assigned_conversation(
        &self,
        customer_id: UserId,
        admin_id: UserId,
    ) -> StoreResult<NewAssignment> {
        let mut state = self.lock();
        if !state.users.contains_key(&customer_id) || !state.users.contains_key(&admin_id) {
            return Err(StoreError::NotFound);
        }

        state.next_conversation_id += 1;
        let now = OffsetDateTime::now_utc();
        let conversation = Conversation {
            id: ConversationId(state.next_conversation_id),
            customer_id,
            admin_id: Some(admin_id),
            status: ConversationStatus::Open,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };
        state.conversations.insert(conversation.id, conversation.clone());

        let admin_load = state.adjust_load(admin_id, 1);
        let admin_state = state.state_entry(admin_id, conversation.id).clone();

        Ok(NewAssignment {
            conversation,
            admin_load,
            admin_state,
        })
    }

    async fn find_open_conversation(
        &self,
        customer_id: UserId,
    ) -> StoreResult<Option<Conversation>> {
        Ok(self
            .lock()
            .conversations
            .values()
            .rev()
            .find(|c| c.customer_id == customer_id && !c.is_closed())
            .cloned())
    }

    async fn list_customer_conversations(
        &self,
        customer_id: UserId,
    ) -> StoreResult<Vec<Conversation>> {
        Ok(self
            .lock()
            .conversations
            .values()
            .rev()
            .filter(|c| c.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn list_admin_conversations(
        &self,
        admin_id: UserId,
        open_only: bool,
    ) -> StoreResult<Vec<Conversation>> {
        Ok(self
            .lock()
            .conversations
            .values()
            .rev()
            .filter(|c| c.admin_id == Some(admin_id) && (!open_only || !c.is_closed()))
            .cloned()
            .collect())
    }

    async fn close_conversation(
        &self,
        id: ConversationId,
        purge_at: OffsetDateTime,
    ) -> StoreResult<Option<Conversation>> {
        let mut state = self.lock();
        let now = OffsetDateTime::now_utc();

        let closed = match state.conversations.get_mut(&id) {
            Some(conversation) if !conversation.is_closed() => {
                conversation.status = ConversationStatus::Closed;
                conversation.updated_at = now;
                conversation.clone()
            }
            _ => return Ok(None),
        };

        for message in state.messages.values_mut().filter(|m| m.conversation_id == id) {
            message.deleted_at.get_or_insert(now);
            message.purge_at = Some(purge_at);
        }

        if let Some(admin_id) = closed.admin_id {
            state.adjust_load(admin_id, -1);
        }

        Ok(Some(closed))
    }

    async fn reopen_conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        Ok(self.lock().reopen(id))
    }

    async fn least_busy_admin(&self) -> StoreResult<Option<AdminAvailability>> {
        let state = self.lock();
        let now = OffsetDateTime::now_utc();

        Ok(state
            .users
            .values()
            .filter(|u| u.role.is_admin())
            .map(|u| {
                state.availability.get(&u.id).cloned().unwrap_or(AdminAvailability {
                    admin_id: u.id,
                    current_conversations: 0,
                    updated_at: now,
                })
            })
            .min_by_key(|a| (a.current_conversations, a.admin_id)))
    }

    async fn admin_availability(&self, admin_id: UserId) -> StoreResult<Option<AdminAvailability>> {
        Ok(self.lock().availability.get(&admin_id).cloned())
    }

    async fn get_admin_state(
        &self,
        admin_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<Option<AdminConversationState>> {
        Ok(self.lock().states.get(&(admin_id, conversation_id)).cloned())
    }

    async fn increment_unread(
        &self,
        admin_id: UserId,
        conversation_id: ConversationId,
    ) -> StoreResult<AdminConversationState> {
        let mut state = self.lock();
        let entry = state.state_entry(admin_id, conversation_id);
        entry.unread_count += 1;
        entry.updated_at = OffsetDateTime::now_utc();
        Ok(entry.clone())
    }

    async fn reset_unread(
        &self,
        admin_id: UserId,
        conversation_id: ConversationId,
        last_message_id: Option<MessageId>,
    ) -> StoreResult<Option<AdminConversationState>> {
        let mut state = self.lock();
        Ok(state.states.get_mut(&(admin_id, conversation_id)).map(|entry| {
            entry.unread_count = 0;
            if last_message_id.is_some() {
                entry.last_message_id = last_message_id;
            }
            entry.updated_at = OffsetDateTime::now_utc();
            entry.clone()
        }))
    }

    async fn list_admin_states(&self, admin_id: UserId) -> StoreResult<Vec<AdminConversationState>> {
        let mut states: Vec<_> = self
            .lock()
            .states
            .values()
            .filter(|s| s.admin_id == admin_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }

    async fn save_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        text: &str,
    ) -> StoreResult<SavedMessage> {
        let mut state = self.lock();
        let closed = match state.conversations.get(&conversation_id) {
            Some(conversation) => conversation.is_closed(),
            None => return Err(StoreError::NotFound),
        };
        let reopened = if closed { state.reopen(conversation_id) } else { None };

        state.next_message_id += 1;
        let now = OffsetDateTime::now_utc();
        let message = Message {
            id: MessageId(state.next_message_id),
            conversation_id,
            sender_id,
            text: text.to_string(),
            created_at: now,
            deleted_at: None,
            purge_at: None,
        };
        state.messages.insert(message.id, message.clone());

        if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
            conversation.last_message_at = Some(now);
            conversation.updated_at = now;
        }

        Ok(SavedMessage { message, reopened })
    }

    async fn message_history(
        &self,
        conversation_id: ConversationId,
        limit: i64,
        cursor: Option<MessageId>,
        visibility: Visibility,
    ) -> StoreResult<MessagePage> {
        let state = self.lock();
        let take = usize::try_from(limit + 1).unwrap_or(usize::MAX);

        let rows: Vec<Message> = state
            .messages
            .values()
            .rev()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| cursor.map_or(true, |c| m.id < c))
            .filter(|m| visibility == Visibility::All || !m.is_deleted())
            .take(take)
            .cloned()
            .collect();

        Ok(page_from_newest_first(rows, limit))
    }

    async fn latest_message_id(
        &self,
        conversation_id: ConversationId,
    ) -> StoreResult<Option<MessageId>> {
        Ok(self
            .lock()
            .messages
            .values()
            .rev()
            .find(|m| m.conversation_id == conversation_id)
            .map(|m| m.id))
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> StoreResult<u64> {
        let mut state = self.lock();
        let before = state.messages.len();
        state
            .messages
            .retain(|_, m| !matches!(m.purge_at, Some(deadline) if deadline <= now));
        Ok((before - state.messages.len()) as u64)
    }
}
