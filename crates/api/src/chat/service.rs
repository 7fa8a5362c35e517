//! Conversation lifecycle and assignment
//!
//! Everything that touches both persistence and live sessions goes through
//! [`ChatService`]: creating and assigning conversations, close/reopen,
//! history reads, the subscribe/send flows used by client sessions, and the
//! background admin notification.

use std::collections::HashMap;
use std::sync::Arc;

use supportdesk_shared::{ConversationId, MessageId, Role, SessionId, StoreError, UserId};
use time::OffsetDateTime;

use super::models::{
    normalize_limit, AdminConversationState, Conversation, ConversationSummary, Message,
    MessagePage, NewAssignment, UserProfile, Visibility, DEFAULT_HISTORY_LIMIT,
};
use super::store::ChatStore;
use crate::auth::Identity;
use crate::websocket::events::{AdminNotification, ConversationCreated, ServerFrame};
use crate::websocket::hub::{Hub, HubError};

/// Longest accepted message, in characters
pub const MAX_MESSAGE_CHARS: usize = 4000;

pub const CONNECTED_MESSAGE: &str = "Successfully connected to WebSocket";

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Conversation not found")]
    ConversationNotFound,
    #[error("You don't have access to this conversation")]
    Forbidden,
    #[error("You are not subscribed to this conversation")]
    NotSubscribed,
    #[error("Message text cannot be empty")]
    EmptyMessage,
    #[error("Message exceeds {0} characters")]
    MessageTooLong(usize),
    #[error("No available admin found")]
    NoAdminAvailable,
    #[error("Invalid conversation ID")]
    InvalidConversationId,
    #[error("Purge deadline out of range")]
    PurgeDeadlineOutOfRange,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hub(#[from] HubError),
}

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    hub: Hub,
    purge_retention: time::Duration,
}

impl ChatService {
    pub fn new(store: Arc<dyn ChatStore>, hub: Hub, purge_retention: time::Duration) -> Self {
        Self {
            store,
            hub,
            purge_retention,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Load a conversation the actor may access
    pub async fn authorized_conversation(
        &self,
        conversation_id: ConversationId,
        actor: &Identity,
    ) -> ChatResult<Conversation> {
        if conversation_id.0 <= 0 {
            return Err(ChatError::InvalidConversationId);
        }
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(ChatError::ConversationNotFound)?;

        if !conversation.can_access(actor.user_id, actor.role) {
            tracing::warn!(
                conversation_id = %conversation_id,
                user_id = %actor.user_id,
                "Unauthorized conversation access attempt"
            );
            return Err(ChatError::Forbidden);
        }
        Ok(conversation)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open a conversation for a customer and assign the least-busy admin
    pub async fn create_customer_conversation(&self, customer: &Identity) -> ChatResult<Conversation> {
        if customer.role != Role::Customer {
            return Err(ChatError::Forbidden);
        }

        let candidate = self
            .store
            .least_busy_admin()
            .await?
            .ok_or(ChatError::NoAdminAvailable)?;
        let admin_id = candidate.admin_id;

        let NewAssignment {
            conversation,
            admin_load,
            admin_state,
        } = self
            .store
            .create_assigned_conversation(customer.user_id, admin_id)
            .await?;

        tracing::info!(
            conversation_id = %conversation.id,
            customer_id = %customer.user_id,
            admin_id = %admin_id,
            admin_load = admin_load.current_conversations,
            "Conversation created and assigned"
        );

        match self.hub.is_user_online(admin_id).await {
            Ok(true) => {
                let customer_profile = self.store.get_user(customer.user_id).await.unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Failed to load customer profile");
                    None
                });
                let admin_profile = self.store.get_user(admin_id).await.unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Failed to load admin profile");
                    None
                });

                let frame = ServerFrame::ConversationCreated(ConversationCreated {
                    conversation: conversation.clone(),
                    customer: customer_profile,
                    admin: admin_profile,
                    admin_state,
                });
                if let Err(e) = self.hub.notify_user(admin_id, frame).await {
                    tracing::warn!(error = %e, admin_id = %admin_id, "Failed to notify admin of assignment");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Hub unavailable for assignment notification"),
        }

        Ok(conversation)
    }

    /// Close the conversation and schedule its messages for purge
    pub async fn close_conversation(
        &self,
        conversation_id: ConversationId,
        actor: &Identity,
    ) -> ChatResult<Conversation> {
        let current = self.authorized_conversation(conversation_id, actor).await?;
        let purge_at = OffsetDateTime::now_utc()
            .checked_add(self.purge_retention)
            .ok_or(ChatError::PurgeDeadlineOutOfRange)?;

        match self.store.close_conversation(conversation_id, purge_at).await? {
            Some(closed) => {
                tracing::info!(
                    conversation_id = %conversation_id,
                    closed_by = %actor.user_id,
                    purge_at = %purge_at,
                    "Conversation closed"
                );
                Ok(closed)
            }
            None => Ok(current),
        }
    }

    /// Reopen a conversation, clearing any pending purge. Soft-deleted
    /// messages stay hidden from non-admins.
    pub async fn reopen_conversation(&self, conversation_id: ConversationId) -> ChatResult<Conversation> {
        match self.store.reopen_conversation(conversation_id).await? {
            Some(reopened) => {
                tracing::info!(conversation_id = %conversation_id, "Conversation reopened");
                Ok(reopened)
            }
            None => self
                .store
                .get_conversation(conversation_id)
                .await?
                .ok_or(ChatError::ConversationNotFound),
        }
    }

    /// History page visible to `viewer`, newest page first via cursor
    pub async fn get_message_history(
        &self,
        conversation_id: ConversationId,
        limit: Option<i64>,
        cursor: Option<MessageId>,
        viewer: &Identity,
    ) -> ChatResult<MessagePage> {
        self.authorized_conversation(conversation_id, viewer).await?;

        Ok(self
            .store
            .message_history(
                conversation_id,
                normalize_limit(limit),
                cursor,
                Visibility::for_role(viewer.role),
            )
            .await?)
    }

    /// The viewer's conversations. Admin listings are enriched with each
    /// customer's profile; a profile that fails to load leaves those fields empty.
    pub async fn list_conversations(&self, viewer: &Identity) -> ChatResult<Vec<ConversationSummary>> {
        if !viewer.is_admin() {
            let conversations = self
                .store
                .list_customer_conversations(viewer.user_id)
                .await?;
            return Ok(conversations.into_iter().map(Into::into).collect());
        }

        let conversations = self
            .store
            .list_admin_conversations(viewer.user_id, false)
            .await?;

        let mut customers: HashMap<UserId, Option<UserProfile>> = HashMap::new();
        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let customer_id = conversation.customer_id;
            if !customers.contains_key(&customer_id) {
                let profile = self.store.get_user(customer_id).await.unwrap_or_else(|e| {
                    tracing::warn!(error = %e, customer_id = %customer_id, "Failed to load customer profile");
                    None
                });
                customers.insert(customer_id, profile);
            }
            let customer = customers.get(&customer_id).and_then(Option::as_ref);
            summaries.push(ConversationSummary::with_customer(conversation, customer));
        }
        Ok(summaries)
    }

    /// Per-conversation unread counters for an admin
    pub async fn list_admin_states(
        &self,
        admin: &Identity,
    ) -> ChatResult<Vec<AdminConversationState>> {
        if !admin.is_admin() {
            return Err(ChatError::Forbidden);
        }
        Ok(self.store.list_admin_states(admin.user_id).await?)
    }

    // -------------------------------------------------------------------------
    // Session flows
    // -------------------------------------------------------------------------

    /// Frames pushed right after a session registers
    pub async fn bootstrap_session(&self, session_id: SessionId, identity: &Identity) -> ChatResult<()> {
        self.hub
            .send_direct(
                session_id,
                ServerFrame::Connected {
                    user_id: identity.user_id,
                    message: CONNECTED_MESSAGE.to_string(),
                },
            )
            .await?;

        match identity.role {
            Role::Admin => {
                let assigned = self
                    .store
                    .list_admin_conversations(identity.user_id, true)
                    .await?;
                for conversation in assigned {
                    self.push_history(session_id, conversation.id, Visibility::All)
                        .await?;
                }
            }
            Role::Customer => {
                if let Some(conversation) =
                    self.store.find_open_conversation(identity.user_id).await?
                {
                    if !self.hub.join(session_id, conversation.id).await? {
                        return Err(ChatError::Hub(HubError::Closed));
                    }
                    self.hub
                        .send_direct(
                            session_id,
                            ServerFrame::ConversationLoaded {
                                conversation_id: conversation.id,
                                status: conversation.status,
                            },
                        )
                        .await?;
                    self.push_history(session_id, conversation.id, Visibility::Public)
                        .await?;
                }
            }
            Role::Seller => {}
        }
        Ok(())
    }

    async fn push_history(
        &self,
        session_id: SessionId,
        conversation_id: ConversationId,
        visibility: Visibility,
    ) -> ChatResult<()> {
        let page = self
            .store
            .message_history(conversation_id, DEFAULT_HISTORY_LIMIT, None, visibility)
            .await?;
        let count = page.messages.len();
        self.hub
            .send_direct(
                session_id,
                ServerFrame::MessageHistory {
                    conversation_id,
                    messages: page.messages,
                    count,
                },
            )
            .await?;
        Ok(())
    }

    /// Authorize, join the room, and for admins mark the conversation read
    pub async fn subscribe(
        &self,
        session_id: SessionId,
        identity: &Identity,
        conversation_id: ConversationId,
    ) -> ChatResult<()> {
        self.authorized_conversation(conversation_id, identity).await?;

        if !self.hub.join(session_id, conversation_id).await? {
            return Err(ChatError::Hub(HubError::Closed));
        }

        if identity.is_admin() {
            let newest = self.store.latest_message_id(conversation_id).await?;
            self.store
                .reset_unread(identity.user_id, conversation_id, newest)
                .await?;
        }

        tracing::debug!(
            session_id = %session_id,
            user_id = %identity.user_id,
            conversation_id = %conversation_id,
            "Subscribed to conversation"
        );
        Ok(())
    }

    pub async fn unsubscribe(
        &self,
        session_id: SessionId,
        conversation_id: ConversationId,
    ) -> ChatResult<()> {
        self.hub.leave(session_id, conversation_id).await?;
        Ok(())
    }

    /// Persist a message from a joined session and fan it out to the room
    pub async fn send_message(
        &self,
        session_id: SessionId,
        sender: &Identity,
        conversation_id: ConversationId,
        text: &str,
    ) -> ChatResult<Message> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(ChatError::ConversationNotFound)?;

        if !self.hub.is_joined(session_id, conversation_id).await? {
            return Err(ChatError::NotSubscribed);
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ChatError::MessageTooLong(MAX_MESSAGE_CHARS));
        }

        // The store reopens a closed conversation in the same write as the insert
        let saved = match self
            .store
            .save_message(conversation_id, sender.user_id, text)
            .await
        {
            Ok(saved) => saved,
            Err(StoreError::NotFound) => return Err(ChatError::ConversationNotFound),
            Err(e) => return Err(e.into()),
        };
        if saved.reopened.is_some() {
            tracing::info!(conversation_id = %conversation_id, "Conversation reopened by new message");
        }
        let conversation = saved.reopened.unwrap_or(conversation);
        let message = saved.message;

        self.spawn_admin_notification(&conversation, &message, sender);

        self.hub
            .broadcast_to_conversation(conversation_id, ServerFrame::NewMessage(message.clone()))
            .await?;

        Ok(message)
    }

    /// Detached: bump the assigned admin's unread count when they are not in
    /// the room, and push a live notification if they are online anywhere.
    fn spawn_admin_notification(&self, conversation: &Conversation, message: &Message, sender: &Identity) {
        if sender.is_admin() {
            return;
        }
        let Some(admin_id) = conversation.admin_id else {
            return;
        };

        let store = Arc::clone(&self.store);
        let hub = self.hub.clone();
        let conversation_id = conversation.id;
        let message_id = message.id;
        let sender_id = sender.user_id;

        tokio::spawn(async move {
            let result = async {
                let in_room = hub.is_user_in_room(admin_id, conversation_id).await?;
                let unread_count = if in_room {
                    store
                        .get_admin_state(admin_id, conversation_id)
                        .await?
                        .map_or(0, |state| state.unread_count)
                } else {
                    store
                        .increment_unread(admin_id, conversation_id)
                        .await?
                        .unread_count
                };

                if hub.is_user_online(admin_id).await? {
                    let frame = ServerFrame::AdminNotification(AdminNotification {
                        conversation_id,
                        message_id,
                        unread_count,
                        sender_id,
                        in_room,
                    });
                    hub.notify_user(admin_id, frame).await?;
                }
                Ok::<(), ChatError>(())
            }
            .await;

            if let Err(e) = result {
                tracing::error!(
                    error = %e,
                    conversation_id = %conversation_id,
                    admin_id = %admin_id,
                    "Admin notification failed"
                );
            }
        });
    }
}
