//! Lifecycle states for clients and servers.

use serde::{Deserialize, Serialize};

/// Current state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Never connected.
    #[default]
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and ready to send/receive data.
    Connected,
    /// Connection closed, either side.
    Disconnected,
    /// The last connect attempt failed. A new attempt is allowed.
    Error,
}

impl ConnectionStatus {
    /// Whether a new connect attempt may start from this state.
    pub fn can_connect(self) -> bool {
        !matches!(self, Self::Connecting | Self::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Current state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Not listening.
    #[default]
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Disconnecting clients and closing the listener.
    Stopping,
    /// The last start attempt failed. A new attempt is allowed.
    Error,
}

impl ServerStatus {
    /// Whether `start` may run from this state.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Error => write!(f, "Error"),
        }
    }
}
