//! Connection adapter
//!
//! Narrows a duplex socket to: read one frame, write one frame, deadlines,
//! close. Any error returned here is terminal for the connection.

use std::future::Future;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::time::{timeout_at, Instant};

use super::events::{ClientFrame, ProtocolError, ServerFrame};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("read deadline exceeded")]
    ReadTimeout,
    #[error("write deadline exceeded")]
    WriteTimeout,
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// What the transport hands up: a text payload or a keepalive signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawInbound {
    Text(String),
    Heartbeat,
}

/// Receiving half of a duplex transport
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound item. `Err(Closed)` once the peer has gone away.
    async fn recv(&mut self) -> Result<RawInbound, ConnectionError>;
}

/// Sending half of a duplex transport
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;
    async fn send_ping(&mut self) -> Result<(), ConnectionError>;
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// A decoded inbound item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(ClientFrame),
    /// Undecodable frame; reported to the client, connection stays up
    Invalid(ProtocolError),
    /// Ping/pong from the peer; counts as activity only
    Heartbeat,
}

// =============================================================================
// Deadline-aware halves
// =============================================================================

pub struct ConnectionReader<S> {
    source: S,
    deadline: Option<Instant>,
}

impl<S: FrameSource> ConnectionReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            deadline: None,
        }
    }

    pub fn set_read_deadline(&mut self, at: Instant) {
        self.deadline = Some(at);
    }

    pub async fn read_frame(&mut self) -> Result<Inbound, ConnectionError> {
        let raw = match self.deadline {
            Some(at) => timeout_at(at, self.source.recv())
                .await
                .map_err(|_| ConnectionError::ReadTimeout)??,
            None => self.source.recv().await?,
        };

        Ok(match raw {
            RawInbound::Heartbeat => Inbound::Heartbeat,
            RawInbound::Text(text) => match ClientFrame::decode(&text) {
                Ok(frame) => Inbound::Frame(frame),
                Err(e) => Inbound::Invalid(e),
            },
        })
    }
}

pub struct ConnectionWriter<K> {
    sink: K,
    deadline: Option<Instant>,
    closed: bool,
}

impl<K: FrameSink> ConnectionWriter<K> {
    pub fn new(sink: K) -> Self {
        Self {
            sink,
            deadline: None,
            closed: false,
        }
    }

    pub fn set_write_deadline(&mut self, at: Instant) {
        self.deadline = Some(at);
    }

    pub async fn write_frame(&mut self, frame: &ServerFrame) -> Result<(), ConnectionError> {
        let text =
            serde_json::to_string(frame).map_err(|e| ConnectionError::Transport(e.to_string()))?;
        write_within(self.deadline, self.sink.send_text(text)).await
    }

    pub async fn write_ping(&mut self) -> Result<(), ConnectionError> {
        write_within(self.deadline, self.sink.send_ping()).await
    }

    /// Close the transport. Only the first call reaches the socket.
    pub async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if let Err(e) = write_within(self.deadline, self.sink.close()).await {
            tracing::debug!(error = %e, "Close handshake failed");
        }
    }
}

async fn write_within<F>(deadline: Option<Instant>, op: F) -> Result<(), ConnectionError>
where
    F: Future<Output = Result<(), ConnectionError>>,
{
    match deadline {
        Some(at) => timeout_at(at, op)
            .await
            .map_err(|_| ConnectionError::WriteTimeout)?,
        None => op.await,
    }
}

// =============================================================================
// axum WebSocket transport
// =============================================================================

pub struct WsSource(SplitStream<WebSocket>);
pub struct WsSink(SplitSink<WebSocket, WsMessage>);

/// Split an upgraded socket into adapter halves
pub fn split_socket(socket: WebSocket) -> (WsSource, WsSink) {
    let (sink, stream) = socket.split();
    (WsSource(stream), WsSink(sink))
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Result<RawInbound, ConnectionError> {
        match self.0.next().await {
            Some(Ok(WsMessage::Text(text))) => Ok(RawInbound::Text(text)),
            Some(Ok(WsMessage::Binary(bytes))) => String::from_utf8(bytes)
                .map(RawInbound::Text)
                .map_err(|_| ConnectionError::Transport("binary frame is not UTF-8".to_string())),
            // axum answers pings itself
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => Ok(RawInbound::Heartbeat),
            Some(Ok(WsMessage::Close(_))) | None => Err(ConnectionError::Closed),
            Some(Err(e)) => Err(ConnectionError::Transport(e.to_string())),
        }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.0
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), ConnectionError> {
        self.0
            .send(WsMessage::Ping(Vec::new()))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        // The peer may already be gone; closing the sink is what matters
        let _ = self.0.send(WsMessage::Close(None)).await;
        self.0
            .close()
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }
}

// =============================================================================
// In-process transport for tests
// =============================================================================
