//! Conversation hub
//!
//! A single task owns the [`RoomRegistry`]; everything else talks to it
//! through bounded mailboxes (`register`, `unregister`, `broadcast`, plus a
//! `control` mailbox for join/leave, direct sends and presence queries).
//! Pushes onto session queues never block: a full queue gets the session
//! unregistered on the spot.

use std::sync::Arc;
use std::time::Duration;

use supportdesk_shared::{ConversationId, SessionId, UserId};
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError},
    oneshot,
};

use super::events::ServerFrame;
use super::room::{Delivery, HubStats, Outbound, RoomRegistry, SessionHandle};

/// Capacity of each hub mailbox
pub const MAILBOX_CAPACITY: usize = 1024;

/// Upper bound on waiting for a mailbox slot from request-handling code
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("conversation hub is not running")]
    Closed,
    #[error("conversation hub did not accept the request in time")]
    Timeout,
}

struct Broadcast {
    conversation_id: ConversationId,
    frame: Outbound,
}

enum Control {
    Join {
        session_id: SessionId,
        conversation_id: ConversationId,
        reply: oneshot::Sender<bool>,
    },
    Leave {
        session_id: SessionId,
        conversation_id: ConversationId,
        reply: oneshot::Sender<bool>,
    },
    SendDirect {
        session_id: SessionId,
        frame: Outbound,
    },
    NotifyUser {
        user_id: UserId,
        frame: Outbound,
        reply: oneshot::Sender<usize>,
    },
    IsJoined {
        session_id: SessionId,
        conversation_id: ConversationId,
        reply: oneshot::Sender<bool>,
    },
    UserInRoom {
        user_id: UserId,
        conversation_id: ConversationId,
        reply: oneshot::Sender<bool>,
    },
    UserOnline {
        user_id: UserId,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Cloneable handle to the hub task
#[derive(Clone)]
pub struct Hub {
    register_tx: mpsc::Sender<SessionHandle>,
    unregister_tx: mpsc::Sender<SessionId>,
    broadcast_tx: mpsc::Sender<Broadcast>,
    control_tx: mpsc::Sender<Control>,
}

impl Hub {
    /// Create the handle and the task body; the caller decides where it runs
    pub fn new() -> (Self, HubRunner) {
        let (register_tx, register_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(MAILBOX_CAPACITY);

        let hub = Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            control_tx,
        };
        let runner = HubRunner {
            registry: RoomRegistry::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            control_rx,
        };
        (hub, runner)
    }

    /// Create the hub and spawn its task on the current runtime
    pub fn spawn() -> Self {
        let (hub, runner) = Self::new();
        tokio::spawn(runner.run());
        hub
    }

    pub async fn register(&self, handle: SessionHandle) -> Result<(), HubError> {
        submit(&self.register_tx, handle).await
    }

    pub async fn unregister(&self, session_id: SessionId) -> Result<(), HubError> {
        submit(&self.unregister_tx, session_id).await
    }

    /// Returns `false` if the session is no longer registered
    pub async fn join(
        &self,
        session_id: SessionId,
        conversation_id: ConversationId,
    ) -> Result<bool, HubError> {
        self.ask(|reply| Control::Join {
            session_id,
            conversation_id,
            reply,
        })
        .await
    }

    /// Returns `false` if the session was not joined
    pub async fn leave(
        &self,
        session_id: SessionId,
        conversation_id: ConversationId,
    ) -> Result<bool, HubError> {
        self.ask(|reply| Control::Leave {
            session_id,
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn broadcast_to_conversation(
        &self,
        conversation_id: ConversationId,
        frame: ServerFrame,
    ) -> Result<(), HubError> {
        submit(
            &self.broadcast_tx,
            Broadcast {
                conversation_id,
                frame: Arc::new(frame),
            },
        )
        .await
    }

    pub async fn send_direct(&self, session_id: SessionId, frame: ServerFrame) -> Result<(), HubError> {
        submit(
            &self.control_tx,
            Control::SendDirect {
                session_id,
                frame: Arc::new(frame),
            },
        )
        .await
    }

    /// Push to every live session of `user_id`; returns how many accepted it
    pub async fn notify_user(&self, user_id: UserId, frame: ServerFrame) -> Result<usize, HubError> {
        let frame = Arc::new(frame);
        self.ask(|reply| Control::NotifyUser {
            user_id,
            frame,
            reply,
        })
        .await
    }

    pub async fn is_joined(
        &self,
        session_id: SessionId,
        conversation_id: ConversationId,
    ) -> Result<bool, HubError> {
        self.ask(|reply| Control::IsJoined {
            session_id,
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn is_user_in_room(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<bool, HubError> {
        self.ask(|reply| Control::UserInRoom {
            user_id,
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn is_user_online(&self, user_id: UserId) -> Result<bool, HubError> {
        self.ask(|reply| Control::UserOnline { user_id, reply }).await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.ask(|reply| Control::Stats { reply }).await
    }

    async fn ask<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Control) -> Result<R, HubError> {
        let (reply, response) = oneshot::channel();
        submit(&self.control_tx, build(reply)).await?;
        response.await.map_err(|_| HubError::Closed)
    }
}

async fn submit<T>(mailbox: &mpsc::Sender<T>, item: T) -> Result<(), HubError> {
    mailbox
        .send_timeout(item, REQUEST_TIMEOUT)
        .await
        .map_err(|e| match e {
            SendTimeoutError::Timeout(_) => HubError::Timeout,
            SendTimeoutError::Closed(_) => HubError::Closed,
        })
}

/// Body of the hub task
pub struct HubRunner {
    registry: RoomRegistry,
    register_rx: mpsc::Receiver<SessionHandle>,
    unregister_rx: mpsc::Receiver<SessionId>,
    broadcast_rx: mpsc::Receiver<Broadcast>,
    control_rx: mpsc::Receiver<Control>,
}

impl HubRunner {
    /// Process requests until every [`Hub`] handle is dropped
    pub async fn run(mut self) {
        tracing::info!("Conversation hub started");

        loop {
            // Registration first so a session's own join never overtakes it.
            // Room traffic drains before control, so presence queries and
            // direct replies queued after a broadcast cannot overtake it.
            tokio::select! {
                biased;
                Some(handle) = self.register_rx.recv() => {
                    self.registry.register(handle);
                }
                Some(session_id) = self.unregister_rx.recv() => {
                    self.registry.unregister(session_id);
                }
                Some(broadcast) = self.broadcast_rx.recv() => {
                    let delivery = self.registry.broadcast(broadcast.conversation_id, &broadcast.frame);
                    self.drop_slow_consumers(delivery);
                }
                Some(control) = self.control_rx.recv() => self.handle_control(control),
                else => break,
            }
        }

        tracing::info!("Conversation hub stopped");
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Join {
                session_id,
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.registry.join(session_id, conversation_id));
            }
            Control::Leave {
                session_id,
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.registry.leave(session_id, conversation_id));
            }
            Control::SendDirect { session_id, frame } => {
                let delivery = self.registry.send_direct(session_id, &frame);
                self.drop_slow_consumers(delivery);
            }
            Control::NotifyUser {
                user_id,
                frame,
                reply,
            } => {
                let delivery = self.registry.notify_user(user_id, &frame);
                let _ = reply.send(delivery.delivered);
                self.drop_slow_consumers(delivery);
            }
            Control::IsJoined {
                session_id,
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.registry.is_joined(session_id, conversation_id));
            }
            Control::UserInRoom {
                user_id,
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.registry.is_user_in_room(user_id, conversation_id));
            }
            Control::UserOnline { user_id, reply } => {
                let _ = reply.send(self.registry.is_user_online(user_id));
            }
            Control::Stats { reply } => {
                let _ = reply.send(self.registry.stats());
            }
        }
    }

    fn drop_slow_consumers(&mut self, delivery: Delivery) {
        for session_id in delivery.dropped {
            self.registry.unregister(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn frame(text: &str) -> ServerFrame {
        ServerFrame::error(text)
    }

    async fn connect(hub: &Hub, user: i64, capacity: usize) -> (SessionId, mpsc::Receiver<Outbound>) {
        let (handle, rx) = SessionHandle::new(UserId(user), capacity);
        let id = handle.session_id;
        hub.register(handle).await.unwrap();
        (id, rx)
    }

    #[tokio::test]
    async fn test_broadcast_is_scoped_to_room() {
        let hub = Hub::spawn();
        let (s1, mut rx1) = connect(&hub, 1, 8).await;
        let (s2, mut rx2) = connect(&hub, 2, 8).await;

        assert!(hub.join(s1, ConversationId(1)).await.unwrap());
        assert!(hub.join(s2, ConversationId(2)).await.unwrap());

        hub.broadcast_to_conversation(ConversationId(1), frame("one"))
            .await
            .unwrap();
        hub.broadcast_to_conversation(ConversationId(2), frame("two"))
            .await
            .unwrap();

        assert_eq!(*rx1.recv().await.unwrap(), frame("one"));
        assert_eq!(*rx2.recv().await.unwrap(), frame("two"));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_direct_reply_never_overtakes_earlier_broadcast() {
        let hub = Hub::spawn();
        let (session, mut rx) = connect(&hub, 1, 64).await;
        assert!(hub.join(session, ConversationId(1)).await.unwrap());

        for i in 0..10 {
            hub.broadcast_to_conversation(ConversationId(1), frame(&format!("room {i}")))
                .await
                .unwrap();
            hub.send_direct(session, frame(&format!("direct {i}")))
                .await
                .unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..20 {
            received.push(rx.recv().await.unwrap());
        }
        let position = |expected: ServerFrame| {
            received.iter().position(|f| **f == expected).unwrap()
        };
        for i in 0..10 {
            assert!(position(frame(&format!("room {i}"))) < position(frame(&format!("direct {i}"))));
        }
    }

    #[tokio::test]
    async fn test_unregister_closes_queue_and_clears_membership() {
        let hub = Hub::spawn();
        let (s1, mut rx1) = connect(&hub, 1, 8).await;
        hub.join(s1, ConversationId(1)).await.unwrap();
        hub.join(s1, ConversationId(2)).await.unwrap();

        hub.unregister(s1).await.unwrap();
        hub.unregister(s1).await.unwrap();

        assert!(rx1.recv().await.is_none());
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats, HubStats::default());
        assert!(!hub.join(s1, ConversationId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_slow_consumer_dropped_without_blocking_room() {
        let hub = Hub::spawn();
        let conversation = ConversationId(42);

        let mut fast = Vec::new();
        for user in 1..=9 {
            let (id, rx) = connect(&hub, user, 8).await;
            hub.join(id, conversation).await.unwrap();
            fast.push(rx);
        }

        let (slow, mut slow_rx) = connect(&hub, 10, 1).await;
        hub.join(slow, conversation).await.unwrap();
        hub.send_direct(slow, frame("filler")).await.unwrap();

        hub.broadcast_to_conversation(conversation, frame("hello"))
            .await
            .unwrap();

        for rx in fast.iter_mut() {
            let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
            assert_eq!(*got.unwrap(), frame("hello"));
        }

        // The filler is still queued, then the queue closes
        assert_eq!(*slow_rx.recv().await.unwrap(), frame("filler"));
        assert!(slow_rx.recv().await.is_none());
        assert_eq!(hub.stats().await.unwrap().sessions, 9);
    }

    #[tokio::test]
    async fn test_presence_queries() {
        let hub = Hub::spawn();
        let (s1, _rx1) = connect(&hub, 7, 8).await;

        assert!(hub.is_user_online(UserId(7)).await.unwrap());
        assert!(!hub.is_user_online(UserId(8)).await.unwrap());
        assert!(!hub.is_user_in_room(UserId(7), ConversationId(3)).await.unwrap());

        hub.join(s1, ConversationId(3)).await.unwrap();
        assert!(hub.is_joined(s1, ConversationId(3)).await.unwrap());
        assert!(hub.is_user_in_room(UserId(7), ConversationId(3)).await.unwrap());

        assert!(hub.leave(s1, ConversationId(3)).await.unwrap());
        assert!(!hub.is_user_in_room(UserId(7), ConversationId(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_notify_user_reaches_all_sessions() {
        let hub = Hub::spawn();
        let (_a, mut rx_a) = connect(&hub, 3, 8).await;
        let (_b, mut rx_b) = connect(&hub, 3, 8).await;

        assert_eq!(hub.notify_user(UserId(3), frame("assigned")).await.unwrap(), 2);
        assert_eq!(hub.notify_user(UserId(4), frame("nobody")).await.unwrap(), 0);
        assert_eq!(*rx_a.recv().await.unwrap(), frame("assigned"));
        assert_eq!(*rx_b.recv().await.unwrap(), frame("assigned"));
    }

    #[tokio::test]
    async fn test_requests_fail_once_hub_task_is_gone() {
        let (hub, runner) = Hub::new();
        drop(runner);

        assert_eq!(hub.stats().await, Err(HubError::Closed));
        assert_eq!(hub.unregister(SessionId::new()).await, Err(HubError::Closed));
    }
}
