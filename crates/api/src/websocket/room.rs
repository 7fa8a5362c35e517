//! Conversation room membership
//!
//! The tables here are owned by the hub task and never shared. A session
//! appears in a room's member set iff that room is in the session's joined
//! set; every mutation keeps both sides in step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use supportdesk_shared::{ConversationId, SessionId, UserId};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::events::ServerFrame;

/// Item on a session's outbound queue
pub type Outbound = Arc<ServerFrame>;

/// The hub's handle on one live session. Holding the only `Sender` means
/// dropping the handle closes the session's outbound queue.
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub user_id: UserId,
    sender: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    /// New handle plus the receiving end of its bounded outbound queue
    pub fn new(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                session_id: SessionId::new(),
                user_id,
                sender,
            },
            receiver,
        )
    }

    /// Non-blocking enqueue; `false` when the queue is full or closed
    fn try_push(&self, frame: &Outbound) -> bool {
        match self.sender.try_send(Arc::clone(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    user_id = %self.user_id,
                    "Outbound queue full, dropping slow consumer"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

struct SessionEntry {
    handle: SessionHandle,
    joined: HashSet<ConversationId>,
}

/// Outcome of a fan-out: how many queues accepted the frame, and which
/// sessions must now be unregistered
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: Vec<SessionId>,
}

/// Snapshot of table sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    pub sessions: usize,
    pub users: usize,
    pub rooms: usize,
    pub memberships: usize,
}

/// Membership table (conversation -> sessions) plus global reachability
/// (user -> sessions)
#[derive(Default)]
pub struct RoomRegistry {
    sessions: HashMap<SessionId, SessionEntry>,
    rooms: HashMap<ConversationId, HashSet<SessionId>>,
    users: HashMap<UserId, HashSet<SessionId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent per session
    pub fn register(&mut self, handle: SessionHandle) -> bool {
        if self.sessions.contains_key(&handle.session_id) {
            return false;
        }

        let session_id = handle.session_id;
        let user_id = handle.user_id;
        self.users.entry(user_id).or_default().insert(session_id);
        self.sessions.insert(
            session_id,
            SessionEntry {
                handle,
                joined: HashSet::new(),
            },
        );

        tracing::info!(
            session_id = %session_id,
            user_id = %user_id,
            total_sessions = self.sessions.len(),
            "Session registered"
        );
        true
    }

    /// Remove the session everywhere and drop its handle (closing its queue).
    /// Safe to call for an unknown session.
    pub fn unregister(&mut self, session_id: SessionId) -> bool {
        let Some(entry) = self.sessions.remove(&session_id) else {
            return false;
        };

        for conversation_id in &entry.joined {
            self.remove_member(*conversation_id, session_id);
        }

        let user_id = entry.handle.user_id;
        if let Some(user_sessions) = self.users.get_mut(&user_id) {
            user_sessions.remove(&session_id);
            if user_sessions.is_empty() {
                self.users.remove(&user_id);
            }
        }

        tracing::info!(
            session_id = %session_id,
            user_id = %user_id,
            rooms_left = entry.joined.len(),
            total_sessions = self.sessions.len(),
            "Session unregistered"
        );
        true
    }

    /// `false` if the session is not registered
    pub fn join(&mut self, session_id: SessionId, conversation_id: ConversationId) -> bool {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return false;
        };

        entry.joined.insert(conversation_id);
        let members = self.rooms.entry(conversation_id).or_default();
        members.insert(session_id);

        tracing::debug!(
            conversation_id = %conversation_id,
            session_id = %session_id,
            room_size = members.len(),
            "Session joined conversation room"
        );
        true
    }

    /// `false` if the session was not in the room
    pub fn leave(&mut self, session_id: SessionId, conversation_id: ConversationId) -> bool {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        if !entry.joined.remove(&conversation_id) {
            return false;
        }

        self.remove_member(conversation_id, session_id);
        tracing::debug!(
            conversation_id = %conversation_id,
            session_id = %session_id,
            "Session left conversation room"
        );
        true
    }

    fn remove_member(&mut self, conversation_id: ConversationId, session_id: SessionId) {
        if let Some(members) = self.rooms.get_mut(&conversation_id) {
            members.remove(&session_id);
            if members.is_empty() {
                self.rooms.remove(&conversation_id);
                tracing::debug!(conversation_id = %conversation_id, "Removed empty conversation room");
            }
        }
    }

    /// Push to every session joined to the conversation
    pub fn broadcast(&self, conversation_id: ConversationId, frame: &Outbound) -> Delivery {
        let mut delivery = Delivery::default();
        let Some(members) = self.rooms.get(&conversation_id) else {
            tracing::debug!(
                conversation_id = %conversation_id,
                frame = frame.kind(),
                "No sessions in conversation room"
            );
            return delivery;
        };

        for session_id in members {
            self.push_into(*session_id, frame, &mut delivery);
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            frame = frame.kind(),
            recipients = delivery.delivered,
            dropped = delivery.dropped.len(),
            "Broadcast frame to conversation room"
        );
        delivery
    }

    /// Push to one session
    pub fn send_direct(&self, session_id: SessionId, frame: &Outbound) -> Delivery {
        let mut delivery = Delivery::default();
        self.push_into(session_id, frame, &mut delivery);
        delivery
    }

    /// Push to every session of a user, regardless of room membership
    pub fn notify_user(&self, user_id: UserId, frame: &Outbound) -> Delivery {
        let mut delivery = Delivery::default();
        if let Some(sessions) = self.users.get(&user_id) {
            for session_id in sessions {
                self.push_into(*session_id, frame, &mut delivery);
            }
        }
        delivery
    }

    fn push_into(&self, session_id: SessionId, frame: &Outbound, delivery: &mut Delivery) {
        if let Some(entry) = self.sessions.get(&session_id) {
            if entry.handle.try_push(frame) {
                delivery.delivered += 1;
            } else {
                delivery.dropped.push(session_id);
            }
        }
    }

    pub fn is_joined(&self, session_id: SessionId, conversation_id: ConversationId) -> bool {
        self.sessions
            .get(&session_id)
            .is_some_and(|entry| entry.joined.contains(&conversation_id))
    }

    /// Presence: any of the user's sessions is joined to the room
    pub fn is_user_in_room(&self, user_id: UserId, conversation_id: ConversationId) -> bool {
        self.users.get(&user_id).is_some_and(|sessions| {
            sessions
                .iter()
                .any(|session_id| self.is_joined(*session_id, conversation_id))
        })
    }

    pub fn is_user_online(&self, user_id: UserId) -> bool {
        self.users.contains_key(&user_id)
    }

    pub fn room_size(&self, conversation_id: ConversationId) -> usize {
        self.rooms.get(&conversation_id).map_or(0, HashSet::len)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            sessions: self.sessions.len(),
            users: self.users.len(),
            rooms: self.rooms.len(),
            memberships: self.rooms.values().map(HashSet::len).sum(),
        }
    }

    /// Both directions of the membership relation agree
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let rooms_match = self.rooms.iter().all(|(conversation_id, members)| {
            !members.is_empty() && members.iter().all(|s| self.is_joined(*s, *conversation_id))
        });
        let sessions_match = self.sessions.iter().all(|(session_id, entry)| {
            entry.joined.iter().all(|c| {
                self.rooms
                    .get(c)
                    .is_some_and(|members| members.contains(session_id))
            })
        });
        let joined_total: usize = self.sessions.values().map(|e| e.joined.len()).sum();
        rooms_match && sessions_match && joined_total == self.stats().memberships
    }
}
