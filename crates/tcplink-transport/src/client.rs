//! TCP client with event-based delivery and optional auto-reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tcplink_core::{
    ClientConfig, ConnectionStatus, DisconnectReason, EventBus, LinkError, LinkEvent, Result,
    is_transport_error,
};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::socket::{endpoint_string, open_stream, read_bounded, write_all_bounded};

/// Mutable client state, guarded by one lock so status transitions are atomic.
#[derive(Default)]
struct ClientState {
    status: ConnectionStatus,
    server_address: Option<String>,
    server_port: Option<u16>,
    local_endpoint: Option<String>,
    remote_endpoint: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    /// Bumped on every successful connect so stale tasks can't tear down a newer session
    generation: u64,
    session: Option<CancellationToken>,
}

/// Write half tagged with the session it belongs to.
struct SessionWriter {
    generation: u64,
    half: OwnedWriteHalf,
}

struct ClientCore {
    id: String,
    config: ClientConfig,
    state: Mutex<ClientState>,
    /// The send lock
    writer: tokio::sync::Mutex<Option<SessionWriter>>,
    events: EventBus,
    auto_reconnect: AtomicBool,
    reconnecting: AtomicBool,
    /// Parent of every session token; cancelled on dispose
    shutdown: CancellationToken,
}

/// A TCP client that owns one outbound connection.
///
/// Received bytes and lifecycle changes are published as [`LinkEvent`]s;
/// call [`subscribe`](Self::subscribe) before connecting to see all of them.
/// Dropping the client disposes it.
///
/// # Example
///
/// ```ignore
/// let client = TcpClient::new(ClientConfig::default().auto_reconnect(true));
/// let mut events = client.subscribe();
///
/// client.connect("127.0.0.1", 9000).await?;
/// client.send(b"hello").await?;
///
/// while let Ok(event) = events.recv().await {
///     if let LinkEvent::DataReceived(data) = event {
///         println!("received {} bytes", data.bytes.len());
///     }
/// }
/// ```
pub struct TcpClient {
    core: Arc<ClientCore>,
}

impl TcpClient {
    /// Create a disconnected client. Zero-valued settings in `config` fall
    /// back to their defaults.
    pub fn new(config: ClientConfig) -> Self {
        let config = config.normalized();
        let events = EventBus::new(config.event_capacity);
        let auto_reconnect = AtomicBool::new(config.auto_reconnect);
        Self {
            core: Arc::new(ClientCore {
                id: uuid::Uuid::new_v4().to_string(),
                config,
                state: Mutex::new(ClientState::default()),
                writer: tokio::sync::Mutex::new(None),
                events,
                auto_reconnect,
                reconnecting: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Connect to `address:port`.
    ///
    /// Fails immediately with `InvalidState` if a connection is already
    /// established or in flight. On success the receive loop is running and
    /// a `Connected` event has been published.
    pub async fn connect(&self, address: &str, port: u16) -> Result<()> {
        self.core.connect(address, port).await
    }

    /// Send the whole buffer. Concurrent calls are serialized, never interleaved.
    ///
    /// An empty buffer is a no-op. A failed write disconnects the client.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.core.send(data).await
    }

    /// Close the connection. Does nothing if not connected.
    pub async fn disconnect(&self) -> Result<()> {
        self.core.teardown(None, DisconnectReason::Manual).await;
        Ok(())
    }

    /// Drop the current connection and, if auto-reconnect is enabled, start
    /// retrying the last endpoint in the background.
    pub async fn reconnect(&self) -> Result<()> {
        if self.core.shutdown.is_cancelled() {
            return Err(LinkError::Disposed);
        }
        if self.core.endpoint().is_none() {
            return Err(LinkError::NoPreviousEndpoint);
        }

        self.core.teardown(None, DisconnectReason::Manual).await;

        if self.core.auto_reconnect.load(Ordering::SeqCst) {
            self.core.spawn_reconnect();
        } else {
            info!("Auto-reconnect disabled, client {} stays disconnected", self.core.id);
        }
        Ok(())
    }

    /// Cancel all background work and close the connection. Safe to call repeatedly.
    pub fn dispose(&self) {
        self.core.dispose();
    }

    /// Turn auto-reconnect on or off. Turning it off stops a running retry
    /// loop before its next attempt.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.core.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_reconnect(&self) -> bool {
        self.core.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Whether a background retry loop is currently running.
    pub fn is_reconnecting(&self) -> bool {
        self.core.reconnecting.load(Ordering::SeqCst)
    }

    /// Register an event subscriber.
    ///
    /// A subscriber that falls more than `event_capacity` events behind gets
    /// `RecvError::Lagged` and loses the skipped events, `Connected` and
    /// `Disconnected` included. Exactly-once delivery holds only for
    /// subscribers that keep up.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.core.events.subscribe()
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.core.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn server_address(&self) -> Option<String> {
        self.core.state.lock().server_address.clone()
    }

    pub fn server_port(&self) -> Option<u16> {
        self.core.state.lock().server_port
    }

    pub fn local_endpoint(&self) -> Option<String> {
        self.core.state.lock().local_endpoint.clone()
    }

    pub fn remote_endpoint(&self) -> Option<String> {
        self.core.state.lock().remote_endpoint.clone()
    }

    /// When the current connection was established.
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.core.state.lock().connected_at
    }

    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("id", &self.core.id)
            .field("status", &self.status())
            .field("remote_endpoint", &self.remote_endpoint())
            .finish()
    }
}

impl ClientCore {
    fn endpoint(&self) -> Option<(String, u16)> {
        let state = self.state.lock();
        match (&state.server_address, state.server_port) {
            (Some(address), Some(port)) => Some((address.clone(), port)),
            _ => None,
        }
    }

    async fn connect(self: &Arc<Self>, address: &str, port: u16) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(LinkError::Disposed);
        }
        {
            let mut state = self.state.lock();
            if !state.status.can_connect() {
                return Err(LinkError::invalid_state("connect", state.status));
            }
            state.status = ConnectionStatus::Connecting;
            state.server_address = Some(address.to_string());
            state.server_port = Some(port);
        }

        let target = format!("{address}:{port}");
        let limit = self.config.connect_timeout_duration();
        debug!("Client {} connecting to {target}", self.id);

        let attempt = tokio::select! {
            _ = self.shutdown.cancelled() => Err(LinkError::Disposed),
            result = tokio::time::timeout(limit, open_stream(address, port, &self.config.socket)) => {
                match result {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(source)) => Err(LinkError::Connect { address: target.clone(), source }),
                    Err(_) => Err(LinkError::ConnectTimeout(limit)),
                }
            }
        };

        let stream = match attempt {
            Ok(stream) => stream,
            Err(err) => {
                self.state.lock().status = if matches!(err, LinkError::Disposed) {
                    ConnectionStatus::Disconnected
                } else {
                    ConnectionStatus::Error
                };
                warn!("Client {} failed to connect to {target}: {err}", self.id);
                self.events.emit(LinkEvent::error(&self.id, err.to_string(), None));
                return Err(err);
            }
        };

        let local = endpoint_string(stream.local_addr());
        let remote = endpoint_string(stream.peer_addr());
        let (reader, writer) = stream.into_split();

        let mut writer_slot = self.writer.lock().await;
        let (generation, session) = {
            let mut state = self.state.lock();
            if self.shutdown.is_cancelled() {
                state.status = ConnectionStatus::Disconnected;
                return Err(LinkError::Disposed);
            }
            state.generation += 1;
            let session = self.shutdown.child_token();
            state.status = ConnectionStatus::Connected;
            state.local_endpoint = Some(local.clone());
            state.remote_endpoint = Some(remote.clone());
            state.connected_at = Some(Utc::now());
            state.session = Some(session.clone());
            (state.generation, session)
        };
        *writer_slot = Some(SessionWriter { generation, half: writer });
        drop(writer_slot);

        info!("Client {} connected: {local} -> {remote}", self.id);
        self.events.emit(LinkEvent::connected(&self.id, &remote));

        let core = self.clone();
        tokio::spawn(async move { core.receive_loop(reader, session, generation).await });
        Ok(())
    }

    async fn send(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (generation, session) = {
            let state = self.state.lock();
            match (&state.session, state.status) {
                (Some(session), ConnectionStatus::Connected) => (state.generation, session.clone()),
                _ => return Err(LinkError::NotConnected),
            }
        };

        let limit = self.config.socket.send_timeout_duration();
        let result = {
            let mut guard = self.writer.lock().await;
            let result = match guard.as_mut() {
                Some(writer) if writer.generation == generation => tokio::select! {
                    result = write_all_bounded(&mut writer.half, data, limit) => result,
                    _ = session.cancelled() => Err(LinkError::NotConnected),
                },
                _ => Err(LinkError::NotConnected),
            };
            // Dispose can't take the half while we hold the lock, so release it here
            if result.is_err() && self.shutdown.is_cancelled() {
                if let Some(mut writer) = guard.take() {
                    let _ = writer.half.shutdown().await;
                }
            }
            result
        };

        if let Err(err) = &result {
            warn!("Client {} send failed: {err}", self.id);
            self.connection_lost(generation, DisconnectReason::SendFailed(err.to_string()))
                .await;
        }
        result
    }

    /// Move from Connected to Disconnected and release the socket.
    ///
    /// `generation` limits the teardown to one session; `None` means the
    /// current one. Returns `false` if there was nothing to tear down, which
    /// keeps the Disconnected event to exactly one per session.
    async fn teardown(&self, generation: Option<u64>, reason: DisconnectReason) -> bool {
        let (generation, session) = {
            let mut state = self.state.lock();
            if state.status != ConnectionStatus::Connected {
                return false;
            }
            if generation.is_some_and(|g| g != state.generation) {
                return false;
            }
            state.status = ConnectionStatus::Disconnected;
            state.connected_at = None;
            (state.generation, state.session.take())
        };

        if let Some(session) = session {
            session.cancel();
        }
        {
            let mut slot = self.writer.lock().await;
            if slot.as_ref().is_some_and(|w| w.generation == generation) {
                if let Some(mut writer) = slot.take() {
                    let _ = writer.half.shutdown().await;
                }
            }
        }

        info!("Client {} disconnected: {reason}", self.id);
        self.events.emit(LinkEvent::disconnected(&self.id, reason));
        true
    }

    /// Tear down after a failure and kick off auto-reconnect if enabled.
    async fn connection_lost(self: &Arc<Self>, generation: u64, reason: DisconnectReason) {
        if self.teardown(Some(generation), reason).await && self.auto_reconnect.load(Ordering::SeqCst) {
            self.spawn_reconnect();
        }
    }

    async fn receive_loop<R>(self: Arc<Self>, mut reader: R, session: CancellationToken, generation: u64)
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = vec![0u8; self.config.socket.receive_buffer_size];
        let read_limit = self.config.socket.receive_timeout_duration();
        let backoff = self.config.receive_error_backoff_duration();

        loop {
            let read = tokio::select! {
                _ = session.cancelled() => break,
                read = read_bounded(&mut reader, &mut buffer, read_limit) => read,
            };

            match read {
                Ok(0) => {
                    self.connection_lost(generation, DisconnectReason::RemoteClosed).await;
                    break;
                }
                Ok(n) => {
                    self.events
                        .emit(LinkEvent::data_received(&self.id, Bytes::copy_from_slice(&buffer[..n])));
                }
                Err(e) if is_transport_error(&e) => {
                    self.connection_lost(generation, DisconnectReason::Transport(e.to_string()))
                        .await;
                    break;
                }
                Err(e) => {
                    warn!("Client {} receive error, retrying: {e}", self.id);
                    self.events
                        .emit(LinkEvent::error(&self.id, format!("receive error: {e}"), Some(e.into())));
                    tokio::select! {
                        _ = session.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
        debug!("Client {} receive loop exited", self.id);
    }

    /// Start the retry loop unless one is already running.
    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Client {} reconnect already in progress", self.id);
            return;
        }
        let core = self.clone();
        tokio::spawn(async move { core.reconnect_loop().await });
    }

    /// Clear the single-flight flag. Returns `true` if the loop should keep
    /// going because a connection dropped while the flag was still set and
    /// nobody else has claimed the retry since.
    fn finish_reconnect(&self) -> bool {
        self.reconnecting.store(false, Ordering::SeqCst);
        let dropped = {
            let state = self.state.lock();
            !matches!(state.status, ConnectionStatus::Connected | ConnectionStatus::Connecting)
        };
        dropped
            && self.auto_reconnect.load(Ordering::SeqCst)
            && !self.shutdown.is_cancelled()
            && !self.reconnecting.swap(true, Ordering::SeqCst)
    }

    /// Retry the last endpoint until connected. Clears the single-flight
    /// flag on every exit.
    async fn reconnect_loop(self: &Arc<Self>) {
        let interval = self.config.reconnect_interval_duration();
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if !self.auto_reconnect.load(Ordering::SeqCst) {
                info!("Client {} auto-reconnect switched off, giving up", self.id);
                break;
            }
            let Some((address, port)) = self.endpoint() else {
                break;
            };

            attempt += 1;
            match self.connect(&address, port).await {
                Ok(()) => {
                    info!("Client {} reconnected after {attempt} attempt(s)", self.id);
                    if self.finish_reconnect() {
                        debug!("Client {} lost the new connection before the retry loop ended", self.id);
                        attempt = 0;
                        continue;
                    }
                    return;
                }
                // Someone else connected, or we were disposed
                Err(LinkError::InvalidState { .. } | LinkError::Disposed) => break,
                Err(e) => debug!("Client {} reconnect attempt {attempt} failed: {e}", self.id),
            }

            if let Some(max) = self.config.max_reconnect_attempts {
                if attempt >= max {
                    warn!("Client {} gave up after {max} reconnect attempts", self.id);
                    self.events.emit(LinkEvent::error(
                        &self.id,
                        format!("max reconnection attempts ({max}) reached"),
                        None,
                    ));
                    break;
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    fn dispose(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.auto_reconnect.store(false, Ordering::SeqCst);

        let was_connected = {
            let mut state = self.state.lock();
            let was_connected = state.status == ConnectionStatus::Connected;
            if matches!(state.status, ConnectionStatus::Connected | ConnectionStatus::Connecting) {
                state.status = ConnectionStatus::Disconnected;
            }
            state.connected_at = None;
            state.session = None;
            was_connected
        };

        self.shutdown.cancel();
        // A sender holding the lock aborts on cancellation and shuts the half down itself
        if let Ok(mut slot) = self.writer.try_lock() {
            slot.take();
        }

        if was_connected {
            self.events.emit(LinkEvent::disconnected(&self.id, DisconnectReason::Shutdown));
        }
        debug!("Client {} disposed", self.id);
    }
}
