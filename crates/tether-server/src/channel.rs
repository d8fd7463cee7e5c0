//! Duplex message channel between a session and its client.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{close_code, Message, WebSocket};
use tracing::debug;

/// Debug renderings of socket errors that mean the connection is already
/// closed. Matched by name so they hold for whichever tungstenite release
/// axum links.
const CLOSED_ERRORS: [&str; 3] = ["ConnectionClosed", "AlreadyClosed", "Protocol(SendAfterClosing)"];

/// One inbound event surfaced to the session loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// An application text payload, treated as a single prompt.
    Prompt(String),
    /// Acknowledgement of a liveness probe.
    Ack,
}

/// Why a channel operation failed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The connection is closed.
    #[error("connection closed (normal: {normal})")]
    Closed {
        /// Set for a peer-initiated graceful close.
        normal: bool,
    },
    /// No message arrived before the session's read deadline.
    #[error("read deadline exceeded")]
    DeadlineExceeded,
    /// Any other socket failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ChannelError {
    /// Whether the peer closed the connection gracefully.
    pub fn is_normal_close(&self) -> bool {
        matches!(self, Self::Closed { normal: true })
    }
}

/// The operations a session needs from a client connection.
///
/// Read deadlines are owned by the session loop, so implementations only
/// need to block until the next message or a failure.
#[async_trait]
pub trait MessageChannel: Send {
    /// Wait for the next prompt or acknowledgement.
    async fn read_message(&mut self) -> Result<Inbound, ChannelError>;
    /// Send one text frame.
    async fn write_text(&mut self, text: &str) -> Result<(), ChannelError>;
    /// Send a liveness probe, failing if it cannot be written within `deadline`.
    async fn write_probe(&mut self, deadline: Duration) -> Result<(), ChannelError>;
    /// Start the closing handshake. A no-op once the peer has closed.
    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// [`MessageChannel`] over an upgraded axum WebSocket.
pub struct WsChannel {
    socket: WebSocket,
    write_wait: Duration,
    peer_closed: bool,
}

impl WsChannel {
    /// Wrap `socket`. Text and close frames must be written within `write_wait`.
    pub fn new(socket: WebSocket, write_wait: Duration) -> Self {
        Self {
            socket,
            write_wait,
            peer_closed: false,
        }
    }

    async fn send(&mut self, message: Message, deadline: Duration) -> Result<(), ChannelError> {
        if self.peer_closed {
            return Err(ChannelError::Closed { normal: true });
        }
        match tokio::time::timeout(deadline, self.socket.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(ChannelError::Transport(format!(
                "write timed out after {deadline:?}"
            ))),
        }
    }
}

#[async_trait]
impl MessageChannel for WsChannel {
    async fn read_message(&mut self) -> Result<Inbound, ChannelError> {
        loop {
            let msg = match self.socket.recv().await {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => return Err(classify(err)),
                None => return Err(ChannelError::Closed { normal: false }),
            };
            match msg {
                Message::Text(text) => return Ok(Inbound::Prompt(text.to_string())),
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => return Ok(Inbound::Prompt(text.to_string())),
                    Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
                },
                Message::Pong(_) => return Ok(Inbound::Ack),
                // Answered by the protocol layer.
                Message::Ping(_) => {}
                Message::Close(frame) => {
                    self.peer_closed = true;
                    let normal = frame.as_ref().map_or(true, |f| {
                        f.code == close_code::NORMAL || f.code == close_code::AWAY
                    });
                    return Err(ChannelError::Closed { normal });
                }
            }
        }
    }

    async fn write_text(&mut self, text: &str) -> Result<(), ChannelError> {
        let deadline = self.write_wait;
        self.send(Message::Text(text.into()), deadline).await
    }

    async fn write_probe(&mut self, deadline: Duration) -> Result<(), ChannelError> {
        self.send(Message::Ping(Default::default()), deadline).await
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if self.peer_closed {
            return Ok(());
        }
        let deadline = self.write_wait;
        self.send(Message::Close(None), deadline).await
    }
}

/// Map an axum socket error, recognising an already-closed connection as a
/// graceful close.
fn classify(err: axum::Error) -> ChannelError {
    let inner = err.into_inner();
    let name = format!("{inner:?}");
    if CLOSED_ERRORS.contains(&name.as_str()) {
        ChannelError::Closed { normal: true }
    } else {
        ChannelError::Transport(inner.to_string())
    }
}
