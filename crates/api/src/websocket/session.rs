//! Client session: one read loop and one write loop per connection
//!
//! The loops share nothing but the outbound queue (written by the hub, drained
//! by the write loop) and a oneshot that tells the read loop the write loop is
//! gone. The read loop owns the session's lifetime and unregisters it on exit.

use std::time::Duration;

use supportdesk_shared::SessionId;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::connection::{
    ConnectionError, ConnectionReader, ConnectionWriter, FrameSink, FrameSource, Inbound,
};
use super::events::{ClientFrame, ServerFrame};
use super::room::{Outbound, SessionHandle};
use crate::auth::Identity;
use crate::chat::{ChatError, ChatService};

/// Drop the connection after this long without any inbound traffic
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Keepalive ping period, comfortably inside the idle timeout
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Per-write deadline on the socket
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest inbound frame accepted at the transport
pub const MAX_FRAME_BYTES: usize = 512 * 1024;

pub struct ClientSession {
    identity: Identity,
    chat: ChatService,
    queue_capacity: usize,
}

impl ClientSession {
    pub fn new(identity: Identity, chat: ChatService, queue_capacity: usize) -> Self {
        Self {
            identity,
            chat,
            queue_capacity,
        }
    }

    /// Drive the connection until either side gives up
    pub async fn run<S, K>(self, source: S, sink: K)
    where
        S: FrameSource,
        K: FrameSink + 'static,
    {
        let hub = self.chat.hub().clone();
        let (handle, outbound) = SessionHandle::new(self.identity.user_id, self.queue_capacity);
        let session_id = handle.session_id;

        let mut writer = ConnectionWriter::new(sink);
        if let Err(e) = hub.register(handle).await {
            tracing::error!(error = %e, user_id = %self.identity.user_id, "Failed to register session");
            writer.set_write_deadline(Instant::now() + WRITE_TIMEOUT);
            writer.close().await;
            return;
        }

        tracing::info!(
            session_id = %session_id,
            user_id = %self.identity.user_id,
            role = %self.identity.role.as_str(),
            "WebSocket session started"
        );

        let (closed_tx, mut closed_rx) = oneshot::channel::<()>();
        let write_task = tokio::spawn(write_loop(writer, outbound, session_id, closed_tx));

        if let Err(e) = self.chat.bootstrap_session(session_id, &self.identity).await {
            tracing::warn!(error = %e, session_id = %session_id, "Failed to push initial data");
            self.reply(session_id, ServerFrame::error(client_message(&e)))
                .await;
        }

        let mut reader = ConnectionReader::new(source);
        loop {
            reader.set_read_deadline(Instant::now() + READ_IDLE_TIMEOUT);

            let inbound = tokio::select! {
                result = reader.read_frame() => result,
                _ = &mut closed_rx => {
                    tracing::debug!(session_id = %session_id, "Write loop exited");
                    break;
                }
            };

            match inbound {
                Ok(Inbound::Frame(frame)) => self.dispatch(session_id, frame).await,
                Ok(Inbound::Invalid(e)) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Rejected client frame");
                    self.reply(session_id, ServerFrame::error(e.to_string())).await;
                }
                Ok(Inbound::Heartbeat) => {}
                Err(ConnectionError::Closed) => break,
                Err(ConnectionError::ReadTimeout) => {
                    tracing::info!(session_id = %session_id, "WebSocket session idle, dropping");
                    break;
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "WebSocket read failed");
                    break;
                }
            }
        }

        // Unregister drops the hub's sender; the write loop drains and closes
        match hub.unregister(session_id).await {
            Ok(()) => {
                if let Err(e) = write_task.await {
                    tracing::error!(session_id = %session_id, error = %e, "Write loop panicked");
                }
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to unregister session");
                write_task.abort();
            }
        }

        tracing::info!(
            session_id = %session_id,
            user_id = %self.identity.user_id,
            "WebSocket session ended"
        );
    }

    async fn dispatch(&self, session_id: SessionId, frame: ClientFrame) {
        let kind = frame.kind();
        let result = match frame {
            ClientFrame::Subscribe { conversation_id } => self
                .chat
                .subscribe(session_id, &self.identity, conversation_id)
                .await
                .map(|()| Some(ServerFrame::Subscribed { conversation_id })),
            ClientFrame::Unsubscribe { conversation_id } => self
                .chat
                .unsubscribe(session_id, conversation_id)
                .await
                .map(|()| Some(ServerFrame::Unsubscribed { conversation_id })),
            // The sender sees its own message through the room broadcast
            ClientFrame::SendMessage {
                conversation_id,
                text,
            } => self
                .chat
                .send_message(session_id, &self.identity, conversation_id, &text)
                .await
                .map(|_| None),
        };

        match result {
            Ok(Some(reply)) => self.reply(session_id, reply).await,
            Ok(None) => {}
            Err(e) => {
                match &e {
                    ChatError::Store(_)
                    | ChatError::Hub(_)
                    | ChatError::PurgeDeadlineOutOfRange => tracing::error!(
                        session_id = %session_id,
                        frame = kind,
                        error = %e,
                        "Failed to handle client frame"
                    ),
                    _ => tracing::debug!(
                        session_id = %session_id,
                        frame = kind,
                        error = %e,
                        "Client frame refused"
                    ),
                }
                self.reply(session_id, ServerFrame::error(client_message(&e)))
                    .await;
            }
        }
    }

    async fn reply(&self, session_id: SessionId, frame: ServerFrame) {
        if let Err(e) = self.chat.hub().send_direct(session_id, frame).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to queue reply");
        }
    }
}

/// Text for an `error` frame; internal failures are not spelled out
fn client_message(err: &ChatError) -> String {
    match err {
        ChatError::Store(_) | ChatError::Hub(_) | ChatError::PurgeDeadlineOutOfRange => {
            "Failed to process request".to_string()
        }
        other => other.to_string(),
    }
}

async fn write_loop<K: FrameSink>(
    mut writer: ConnectionWriter<K>,
    mut outbound: mpsc::Receiver<Outbound>,
    session_id: SessionId,
    _closed: oneshot::Sender<()>,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(frame) = next else {
                    break;
                };
                writer.set_write_deadline(Instant::now() + WRITE_TIMEOUT);
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::debug!(session_id = %session_id, error = %e, "WebSocket write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                writer.set_write_deadline(Instant::now() + WRITE_TIMEOUT);
                if let Err(e) = writer.write_ping().await {
                    tracing::debug!(session_id = %session_id, error = %e, "WebSocket ping failed");
                    break;
                }
            }
        }
    }

    writer.set_write_deadline(Instant::now() + WRITE_TIMEOUT);
    writer.close().await;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::chat::models::UserProfile;
    use crate::chat::MemoryChatStore;
    use crate::websocket::connection::testing::{pair, Peer, Written};
    use crate::websocket::hub::Hub;
    use crate::websocket::room::HubStats;
    use serde_json::json;
    use std::sync::Arc;
    use supportdesk_shared::Role;
    use tokio::task::JoinHandle;

    struct Fixture {
        store: Arc<MemoryChatStore>,
        hub: Hub,
        chat: ChatService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryChatStore::new());
        let hub = Hub::spawn();
        let chat = ChatService::new(store.clone(), hub.clone(), time::Duration::days(30));
        Fixture { store, hub, chat }
    }

    fn identity(profile: &UserProfile) -> Identity {
        Identity {
            user_id: profile.id,
            username: profile.username.clone(),
            role: profile.role,
        }
    }

    fn start(f: &Fixture, who: Identity) -> (JoinHandle<()>, Peer) {
        let (source, sink, peer) = pair();
        let session = ClientSession::new(who, f.chat.clone(), 16);
        (tokio::spawn(session.run(source, sink)), peer)
    }

    #[tokio::test]
    async fn test_customer_gets_initial_data_and_can_chat() {
        let f = fixture();
        f.store.insert_user("dana", Role::Admin);
        let customer = identity(&f.store.insert_user("carol", Role::Customer));
        let conversation = f.chat.create_customer_conversation(&customer).await.unwrap();

        let (_task, mut peer) = start(&f, customer.clone());

        let connected = peer.next_json().await.unwrap();
        assert_eq!(connected["type"], "connected");
        assert_eq!(connected["payload"]["user_id"], customer.user_id.0);
        let loaded = peer.next_json().await.unwrap();
        assert_eq!(loaded["type"], "conversation_loaded");
        assert_eq!(loaded["payload"]["status"], "open");
        let history = peer.next_json().await.unwrap();
        assert_eq!(history["type"], "message_history");
        assert_eq!(history["payload"]["count"], 0);

        peer.send_json(json!({
            "type": "send_message",
            "payload": {"conversation_id": conversation.id.0.to_string(), "text": "  hello  "}
        }));
        let message = peer.next_json().await.unwrap();
        assert_eq!(message["type"], "new_message");
        assert_eq!(message["payload"]["message_text"], "hello");
        assert_eq!(message["payload"]["conversation_id"], conversation.id.0);
    }

    #[tokio::test]
    async fn test_protocol_errors_keep_connection_open() {
        let f = fixture();
        let seller = identity(&f.store.insert_user("sam", Role::Seller));
        let (_task, mut peer) = start(&f, seller);
        assert_eq!(peer.next_json().await.unwrap()["type"], "connected");

        peer.inbound
            .send(crate::websocket::connection::RawInbound::Text("{not json".to_string()))
            .unwrap();
        let reply = peer.next_json().await.unwrap();
        assert_eq!(reply["payload"]["error"], "Invalid message format");

        peer.send_json(json!({"type": "dance", "payload": {}}));
        let reply = peer.next_json().await.unwrap();
        assert_eq!(reply["payload"]["error"], "Unknown message type: dance");

        peer.send_json(json!({"type": "subscribe", "payload": {"conversation_id": 0}}));
        let reply = peer.next_json().await.unwrap();
        assert_eq!(reply["type"], "error");

        peer.send_json(json!({"type": "subscribe", "payload": {"conversation_id": 77}}));
        let reply = peer.next_json().await.unwrap();
        assert_eq!(reply["payload"]["error"], "Conversation not found");
    }

    #[tokio::test]
    async fn test_send_without_subscription_is_refused() {
        let f = fixture();
        let admin = identity(&f.store.insert_user("dana", Role::Admin));
        let customer = identity(&f.store.insert_user("carol", Role::Customer));
        let conversation = f.chat.create_customer_conversation(&customer).await.unwrap();

        let (_task, mut peer) = start(&f, admin);
        assert_eq!(peer.next_json().await.unwrap()["type"], "connected");
        assert_eq!(peer.next_json().await.unwrap()["type"], "message_history");

        peer.send_json(json!({
            "type": "send_message",
            "payload": {"conversation_id": conversation.id.0, "text": "hi"}
        }));
        let reply = peer.next_json().await.unwrap();
        assert_eq!(
            reply["payload"]["error"],
            "You are not subscribed to this conversation"
        );

        peer.send_json(json!({"type": "subscribe", "payload": {"conversation_id": conversation.id.0}}));
        let reply = peer.next_json().await.unwrap();
        assert_eq!(reply["type"], "subscribed");

        peer.send_json(json!({"type": "unsubscribe", "payload": {"conversation_id": conversation.id.0}}));
        let reply = peer.next_json().await.unwrap();
        assert_eq!(reply["type"], "unsubscribed");
    }

    #[tokio::test]
    async fn test_peer_disconnect_unregisters() {
        let f = fixture();
        let seller = identity(&f.store.insert_user("sam", Role::Seller));
        let (task, mut peer) = start(&f, seller);
        assert_eq!(peer.next_json().await.unwrap()["type"], "connected");

        drop(peer.inbound);
        task.await.unwrap();

        assert_eq!(peer.written.recv().await, Some(Written::Close));
        assert_eq!(f.hub.stats().await.unwrap(), HubStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_dropped() {
        let f = fixture();
        let seller = identity(&f.store.insert_user("sam", Role::Seller));
        let (task, mut peer) = start(&f, seller);

        let started = Instant::now();
        task.await.unwrap();
        assert!(started.elapsed() >= READ_IDLE_TIMEOUT);

        let mut saw_ping = false;
        let mut saw_close = false;
        while let Ok(written) = peer.written.try_recv() {
            match written {
                Written::Ping => saw_ping = true,
                Written::Close => saw_close = true,
                Written::Text(_) => {}
            }
        }
        assert!(saw_ping);
        assert!(saw_close);
        assert_eq!(f.hub.stats().await.unwrap().sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writer_tears_session_down() {
        let f = fixture();
        let seller = identity(&f.store.insert_user("sam", Role::Seller));
        let (source, mut sink, peer) = pair();
        sink.stalled = true;

        let started = Instant::now();
        ClientSession::new(seller, f.chat.clone(), 16)
            .run(source, sink)
            .await;

        // Ended by the write deadline, well before the idle timeout
        assert!(started.elapsed() < READ_IDLE_TIMEOUT);
        assert_eq!(f.hub.stats().await.unwrap().sessions, 0);
        drop(peer);
    }
}
