//! Event vocabulary shared by the client and the server.
//!
//! Every component owns an [`EventBus`]. Subscribers receive immutable
//! [`LinkEvent`] values from the task that observed the event, so they must
//! not assume any particular thread.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::error::LinkError;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed locally via `disconnect`.
    Manual,
    /// The peer closed its side (zero-byte read).
    RemoteClosed,
    /// The transport failed: reset, broken pipe, read timeout.
    Transport(String),
    /// The liveness check found the socket dead.
    LivenessLost(String),
    /// A write failed and the connection was dropped.
    SendFailed(String),
    /// The server closed this client on request.
    Kicked,
    /// The server is shutting down.
    ServerStopping,
    /// The owning component was disposed.
    Shutdown,
}

impl DisconnectReason {
    /// Whether the remote side (or the wire) ended the connection.
    pub fn is_peer_initiated(&self) -> bool {
        matches!(self, Self::RemoteClosed | Self::Transport(_))
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "disconnected manually"),
            Self::RemoteClosed => write!(f, "closed by peer"),
            Self::Transport(msg) => write!(f, "transport failure: {msg}"),
            Self::LivenessLost(msg) => write!(f, "liveness check failed: {msg}"),
            Self::SendFailed(msg) => write!(f, "send failed: {msg}"),
            Self::Kicked => write!(f, "disconnected by server"),
            Self::ServerStopping => write!(f, "server stopping"),
            Self::Shutdown => write!(f, "shut down"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectedEvent {
    pub id: String,
    pub remote_address: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DisconnectedEvent {
    pub id: String,
    pub reason: DisconnectReason,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DataReceivedEvent {
    pub id: String,
    pub bytes: Bytes,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub id: String,
    pub message: String,
    pub cause: Option<Arc<LinkError>>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ServerStartedEvent {
    pub id: String,
    pub local_address: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ServerStoppedEvent {
    pub id: String,
    pub time: DateTime<Utc>,
}

/// An event published by a client or server.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected(ConnectedEvent),
    Disconnected(DisconnectedEvent),
    DataReceived(DataReceivedEvent),
    Error(ErrorEvent),
    ServerStarted(ServerStartedEvent),
    ServerStopped(ServerStoppedEvent),
}

impl LinkEvent {
    pub fn connected(id: impl Into<String>, remote_address: impl Into<String>) -> Self {
        Self::Connected(ConnectedEvent {
            id: id.into(),
            remote_address: remote_address.into(),
            time: Utc::now(),
        })
    }

    pub fn disconnected(id: impl Into<String>, reason: DisconnectReason) -> Self {
        Self::Disconnected(DisconnectedEvent {
            id: id.into(),
            reason,
            time: Utc::now(),
        })
    }

    pub fn data_received(id: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self::DataReceived(DataReceivedEvent {
            id: id.into(),
            bytes: bytes.into(),
            time: Utc::now(),
        })
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>, cause: Option<LinkError>) -> Self {
        Self::Error(ErrorEvent {
            id: id.into(),
            message: message.into(),
            cause: cause.map(Arc::new),
            time: Utc::now(),
        })
    }

    pub fn server_started(id: impl Into<String>, local_address: impl Into<String>) -> Self {
        Self::ServerStarted(ServerStartedEvent {
            id: id.into(),
            local_address: local_address.into(),
            time: Utc::now(),
        })
    }

    pub fn server_stopped(id: impl Into<String>) -> Self {
        Self::ServerStopped(ServerStoppedEvent {
            id: id.into(),
            time: Utc::now(),
        })
    }

    /// Id of the client or connection the event belongs to.
    pub fn id(&self) -> &str {
        match self {
            Self::Connected(e) => &e.id,
            Self::Disconnected(e) => &e.id,
            Self::DataReceived(e) => &e.id,
            Self::Error(e) => &e.id,
            Self::ServerStarted(e) => &e.id,
            Self::ServerStopped(e) => &e.id,
        }
    }
}

/// Fan-out publisher for [`LinkEvent`]s.
///
/// Slow subscribers that fall more than `capacity` events behind observe
/// `RecvError::Lagged` and skip ahead; the publisher never blocks.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LinkEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new subscriber. It sees events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LinkEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
