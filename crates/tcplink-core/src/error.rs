//! Error types shared by the TCP client and server.

use std::io;
use std::time::Duration;

use crate::status::{ConnectionStatus, ServerStatus};

/// Either side's lifecycle state, used when reporting an invalid transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Client(ConnectionStatus),
    Server(ServerStatus),
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client(status) => write!(f, "{status}"),
            Self::Server(status) => write!(f, "{status}"),
        }
    }
}

impl From<ConnectionStatus> for LinkState {
    fn from(status: ConnectionStatus) -> Self {
        Self::Client(status)
    }
}

impl From<ServerStatus> for LinkState {
    fn from(status: ServerStatus) -> Self {
        Self::Server(status)
    }
}

/// Errors returned by client and server operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The operation is not allowed in the component's current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: LinkState,
    },

    #[error("not connected")]
    NotConnected,

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// At least one connection failed during a broadcast.
    #[error("broadcast failed for {failed} of {total} connections")]
    BroadcastIncomplete { failed: usize, total: usize },

    #[error("no previous endpoint to reconnect to")]
    NoPreviousEndpoint,

    #[error("component has been disposed")]
    Disposed,

    #[error("configuration error: {0}")]
    Config(String),
}

impl LinkError {
    pub fn invalid_state(operation: &'static str, state: impl Into<LinkState>) -> Self {
        Self::InvalidState {
            operation,
            state: state.into(),
        }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Classifies an I/O error as a lost connection rather than a transient fault.
///
/// Timeouts count as transport failures: a read or write that exceeds its
/// configured bound is treated the same as a reset.
pub fn is_transport_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WriteZero
    )
}

/// A specialized Result type for link operations.
pub type Result<T> = std::result::Result<T, LinkError>;
