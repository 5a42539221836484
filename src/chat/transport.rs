//! WebSocket transport.
//!
//! Each connection attempt runs in its own task. The task reports what
//! happens on the wire as [`TransportEvent`]s tagged with the attempt's
//! [`ConnectionId`] and takes [`TransportCommand`]s from its handle.
//! The connection actor owns at most one [`TransportHandle`] at a time.

use std::fmt;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

/// Identifies one transport attempt. Strictly increasing per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events emitted by a transport task to the connection actor
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened { id: ConnectionId },
    /// One inbound text frame, undecoded.
    Frame { id: ConnectionId, text: String },
    /// Always followed by `Closed` for the same attempt.
    Error { id: ConnectionId, error: String },
    Closed { id: ConnectionId, reason: String },
}

/// Commands sent by the connection actor to a transport task
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    SendText(String),
    Close,
}

/// Owning handle on one transport attempt.
///
/// Dropping the handle also ends the attempt: the task sees its command
/// channel close and shuts the socket.
#[derive(Debug)]
pub struct TransportHandle {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportHandle {
    pub fn new(id: ConnectionId, commands: mpsc::UnboundedSender<TransportCommand>) -> Self {
        Self { id, commands }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a text frame. Returns false if the attempt has already ended.
    pub fn send_text(&self, frame: String) -> bool {
        self.commands.send(TransportCommand::SendText(frame)).is_ok()
    }

    pub fn close(self) {
        let _ = self.commands.send(TransportCommand::Close);
    }
}

/// Opens transport attempts. Opening never blocks: the outcome arrives
/// later on `events`.
pub trait Connector: Send + Sync + 'static {
    fn open(
        &self,
        id: ConnectionId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> TransportHandle;
}

/// Connects to a fixed WebSocket endpoint.
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

impl Connector for WsConnector {
    fn open(
        &self,
        id: ConnectionId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> TransportHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(id, self.url.clone(), events, cmd_rx));
        TransportHandle::new(id, cmd_tx)
    }
}

/// Drives one attempt: handshake, then the read/write loop until either
/// side closes. Nothing is reported after a local close.
async fn run_connection(
    id: ConnectionId,
    url: Url,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
) {
    info!("Connecting to {url} (connection {id})...");

    // Phase 1: handshake, abandoned if the handle is closed meanwhile
    let connected = tokio::select! {
        result = connect_async(url.as_str()) => result,
        _ = wait_for_close(&mut commands) => {
            debug!("Connection {id} closed before the handshake completed");
            return;
        }
    };

    let ws_stream = match connected {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            let _ = events.send(TransportEvent::Error { id, error: e.to_string() });
            let _ = events.send(TransportEvent::Closed {
                id,
                reason: "handshake failed".into(),
            });
            return;
        }
    };

    info!("WebSocket handshake completed with {url} (connection {id})");
    let _ = events.send(TransportEvent::Opened { id });

    // Phase 2: read/write loop
    let (mut sink, mut stream) = ws_stream.split();
    let reason = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    debug!("Received frame on {id}: {text}");
                    let _ = events.send(TransportEvent::Frame { id, text });
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| format!("closed by server ({}: {})", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "closed by server".to_string());
                }
                Some(Ok(_)) => {
                    // Binary, ping and pong carry no chat messages
                }
                Some(Err(e)) => {
                    error!("Read error on {id}: {e}");
                    let _ = events.send(TransportEvent::Error { id, error: e.to_string() });
                    break "read error".to_string();
                }
                None => break "stream ended".to_string(),
            },
            cmd = commands.recv() => match cmd {
                Some(TransportCommand::SendText(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        error!("Write error on {id}: {e}");
                        let _ = events.send(TransportEvent::Error { id, error: e.to_string() });
                        break "write error".to_string();
                    }
                }
                Some(TransportCommand::Close) | None => {
                    debug!("Closing connection {id}");
                    if let Err(e) = sink.close().await {
                        warn!("Error while closing connection {id}: {e}");
                    }
                    return;
                }
            },
        }
    };

    warn!("Connection {id} closed: {reason}");
    let _ = events.send(TransportEvent::Closed { id, reason });
}

/// Resolves once the handle asks to close or is dropped. Frames queued
/// before the socket is open are discarded.
async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<TransportCommand>) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            TransportCommand::Close => return,
            TransportCommand::SendText(_) => {
                warn!("Dropping frame queued before the connection opened");
            }
        }
    }
}
