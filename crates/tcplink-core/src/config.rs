//! Configuration for clients and servers.
//!
//! All values are passed in at construction or start time. Durations are
//! stored as milliseconds so the structs stay trivially serializable.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Socket-level options applied to every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SocketConfig {
    /// Enable TCP_NODELAY (disable Nagle's algorithm).
    pub no_delay: bool,
    /// Size of the buffer each read fills, and the socket receive buffer.
    pub receive_buffer_size: usize,
    /// Socket send buffer size.
    pub send_buffer_size: usize,
    /// Read timeout in milliseconds. `None` means no timeout.
    pub receive_timeout_ms: Option<u64>,
    /// Write timeout in milliseconds. `None` means no timeout.
    pub send_timeout_ms: Option<u64>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            receive_buffer_size: 8192,
            send_buffer_size: 8192,
            receive_timeout_ms: None,
            send_timeout_ms: None,
        }
    }
}

impl SocketConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = size;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn receive_timeout_duration(&self) -> Option<Duration> {
        self.receive_timeout_ms.map(Duration::from_millis)
    }

    pub fn send_timeout_duration(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.receive_buffer_size == 0 {
            self.receive_buffer_size = defaults.receive_buffer_size;
        }
        if self.send_buffer_size == 0 {
            self.send_buffer_size = defaults.send_buffer_size;
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.receive_buffer_size == 0 {
            return Err(LinkError::Config("receiveBufferSize must be greater than zero".into()));
        }
        if self.send_buffer_size == 0 {
            return Err(LinkError::Config("sendBufferSize must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Configuration for a TCP client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub socket: SocketConfig,
    /// Bound on a single connect attempt.
    pub connect_timeout_ms: u64,
    /// Keep retrying after a lost connection or an explicit reconnect.
    pub auto_reconnect: bool,
    /// Fixed wait between reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Give up after this many attempts. `None` retries until auto-reconnect
    /// is switched off.
    pub max_reconnect_attempts: Option<u32>,
    /// Pause after a transient receive error before reading again.
    pub receive_error_backoff_ms: u64,
    /// Events buffered per subscriber before it starts lagging.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            connect_timeout_ms: 5_000,
            auto_reconnect: false,
            reconnect_interval_ms: 3_000,
            max_reconnect_attempts: None,
            receive_error_backoff_ms: 100,
            event_capacity: 1024,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket_config(mut self, socket: SocketConfig) -> Self {
        self.socket = socket;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    /// Enable or disable auto-reconnect.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = duration_ms(interval);
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn receive_error_backoff(mut self, backoff: Duration) -> Self {
        self.receive_error_backoff_ms = duration_ms(backoff);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval_duration(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn receive_error_backoff_duration(&self) -> Duration {
        Duration::from_millis(self.receive_error_backoff_ms)
    }

    /// Replace zero sizes and timeouts, which would stall or break the
    /// connection loops, with their defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.socket = self.socket.normalized();
        if self.connect_timeout_ms == 0 {
            self.connect_timeout_ms = defaults.connect_timeout_ms;
        }
        if self.event_capacity == 0 {
            self.event_capacity = defaults.event_capacity;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.socket.validate()?;
        if self.connect_timeout_ms == 0 {
            return Err(LinkError::Config("connectTimeoutMs must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Configuration for a TCP server.
///
/// The bind address, port, and backlog are arguments to `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Options applied to every accepted socket.
    pub socket: SocketConfig,
    /// How long a connection handler waits for data before probing liveness.
    pub poll_interval_ms: u64,
    /// Maximum concurrent connections. Extra sockets are closed on accept.
    pub max_connections: Option<usize>,
    /// Events buffered per subscriber before it starts lagging.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            poll_interval_ms: 100,
            max_connections: None,
            event_capacity: 1024,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket_config(mut self, socket: SocketConfig) -> Self {
        self.socket = socket;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Replace zero sizes and intervals with their defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.socket = self.socket.normalized();
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = defaults.poll_interval_ms;
        }
        if self.event_capacity == 0 {
            self.event_capacity = defaults.event_capacity;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.socket.validate()?;
        if self.poll_interval_ms == 0 {
            return Err(LinkError::Config("pollIntervalMs must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Combined client and server settings, as loaded from a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl LinkConfig {
    /// Parse and validate a JSON config document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.client.validate()?;
        config.server.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LinkError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
