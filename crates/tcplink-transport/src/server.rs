//! TCP server that accepts many clients and tracks them in a registry.
//!
//! Each accepted socket gets its own handler task. The handler owns the
//! read half, waits for readiness bounded by the poll interval, and checks
//! the socket for liveness whenever the interval passes without data. Its
//! finalizer is the only place a connection leaves the registry.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tcplink_core::{DisconnectReason, EventBus, LinkError, LinkEvent, Result, ServerConfig, ServerStatus};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::connection::{ClientConnection, ConnectionInfo};
use crate::socket::{bind_listener, endpoint_string};

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) doesn't spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Handles for one start/stop cycle.
struct RunHandle {
    /// Parent of every connection token in this run
    run_token: CancellationToken,
    accept_token: CancellationToken,
    accept_task: JoinHandle<()>,
}

#[derive(Default)]
struct ServerState {
    status: ServerStatus,
    local_addr: Option<SocketAddr>,
    run: Option<RunHandle>,
}

struct ServerCore {
    id: String,
    config: ServerConfig,
    state: Mutex<ServerState>,
    /// Serializes start and stop
    lifecycle: tokio::sync::Mutex<()>,
    connections: DashMap<String, Arc<ClientConnection>>,
    handlers: TaskTracker,
    events: EventBus,
    shutdown: CancellationToken,
}

/// A TCP server managing any number of concurrent client connections.
///
/// # Example
///
/// ```ignore
/// let server = TcpServer::new(ServerConfig::default());
/// let mut events = server.subscribe();
/// server.start("127.0.0.1", 9000, 5).await?;
///
/// while let Ok(event) = events.recv().await {
///     if let LinkEvent::DataReceived(data) = event {
///         server.send(&data.id, &data.bytes).await?;
///     }
/// }
/// ```
pub struct TcpServer {
    core: Arc<ServerCore>,
}

impl TcpServer {
    /// Create a stopped server. Zero-valued settings in `config` fall back
    /// to their defaults.
    pub fn new(config: ServerConfig) -> Self {
        let config = config.normalized();
        let events = EventBus::new(config.event_capacity);
        Self {
            core: Arc::new(ServerCore {
                id: uuid::Uuid::new_v4().to_string(),
                config,
                state: Mutex::new(ServerState::default()),
                lifecycle: tokio::sync::Mutex::new(()),
                connections: DashMap::new(),
                handlers: TaskTracker::new(),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Bind `ip:port` and start accepting connections.
    ///
    /// Only allowed from `Stopped` or `Error`. An unparsable `ip` or a bind
    /// failure returns an error and publishes an `Error` event; the server
    /// can be started again afterwards.
    pub async fn start(&self, ip: &str, port: u16, backlog: u32) -> Result<()> {
        let _lifecycle = self.core.lifecycle.lock().await;
        if self.core.shutdown.is_cancelled() {
            return Err(LinkError::Disposed);
        }
        {
            let mut state = self.core.state.lock();
            if !state.status.can_start() {
                return Err(LinkError::invalid_state("start", state.status));
            }
            state.status = ServerStatus::Starting;
        }

        let ip_addr: IpAddr = match ip.trim().parse() {
            Ok(addr) => addr,
            Err(_) => {
                let err = LinkError::InvalidAddress(ip.to_string());
                warn!("Server {} not started: {err}", self.core.id);
                self.core.state.lock().status = ServerStatus::Stopped;
                self.core.events.emit(LinkEvent::error(&self.core.id, err.to_string(), None));
                return Err(err);
            }
        };
        let bind_addr = SocketAddr::new(ip_addr, port);

        let bound = bind_listener(bind_addr, backlog, &self.core.config.socket)
            .and_then(|listener| listener.local_addr().map(|addr| (listener, addr)));
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                let err = LinkError::Bind {
                    address: bind_addr.to_string(),
                    source,
                };
                error!("Server {} failed to start: {err}", self.core.id);
                self.core.state.lock().status = ServerStatus::Error;
                self.core.events.emit(LinkEvent::error(&self.core.id, err.to_string(), None));
                return Err(err);
            }
        };

        let run_token = self.core.shutdown.child_token();
        let accept_token = run_token.child_token();
        let core = self.core.clone();
        let accept_task = tokio::spawn(core.accept_loop(listener, run_token.clone(), accept_token.clone()));

        {
            let mut state = self.core.state.lock();
            state.status = ServerStatus::Running;
            state.local_addr = Some(local_addr);
            state.run = Some(RunHandle {
                run_token,
                accept_token,
                accept_task,
            });
        }

        info!("Server {} listening on {local_addr} (backlog {backlog})", self.core.id);
        self.core
            .events
            .emit(LinkEvent::server_started(&self.core.id, local_addr.to_string()));
        Ok(())
    }

    /// Stop accepting, disconnect every client, and close the listener.
    ///
    /// Returns once all connection handlers have exited. A no-op when
    /// already stopped.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.core.lifecycle.lock().await;
        let run = {
            let mut state = self.core.state.lock();
            if state.status == ServerStatus::Stopped {
                return Ok(());
            }
            state.status = ServerStatus::Stopping;
            state.run.take()
        };

        if let Some(run) = run {
            run.accept_token.cancel();
            if let Err(e) = run.accept_task.await {
                warn!("Server {} accept loop ended abnormally: {e}", self.core.id);
            }

            for conn in self.core.snapshot() {
                conn.request_close(DisconnectReason::ServerStopping);
            }
            // Also reaches handlers that were spawned but had not registered yet
            run.run_token.cancel();
        }

        self.core.handlers.close();
        self.core.handlers.wait().await;
        self.core.handlers.reopen();

        {
            let mut state = self.core.state.lock();
            state.status = ServerStatus::Stopped;
            state.local_addr = None;
        }
        info!("Server {} stopped", self.core.id);
        self.core.events.emit(LinkEvent::server_stopped(&self.core.id));
        Ok(())
    }

    /// Send the whole buffer to one connection.
    ///
    /// A failed write disconnects that connection.
    pub async fn send(&self, id: &str, data: &[u8]) -> Result<()> {
        let conn = self
            .core
            .connection(id)
            .ok_or_else(|| LinkError::UnknownConnection(id.to_string()))?;
        self.core.send_to(&conn, data).await
    }

    /// Send the buffer to every registered connection concurrently.
    ///
    /// Connections that fail are disconnected individually; the others still
    /// receive the data. Fails with `BroadcastIncomplete` if any send failed.
    pub async fn broadcast(&self, data: &[u8]) -> Result<()> {
        let targets = self.core.snapshot();
        let total = targets.len();
        let results = join_all(targets.iter().map(|conn| self.core.send_to(conn, data))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!("Server {} broadcast failed for {failed} of {total} connections", self.core.id);
            return Err(LinkError::BroadcastIncomplete { failed, total });
        }
        Ok(())
    }

    /// Close one connection and wait until it has left the registry.
    pub async fn disconnect_client(&self, id: &str) -> Result<()> {
        let conn = self
            .core
            .connection(id)
            .ok_or_else(|| LinkError::UnknownConnection(id.to_string()))?;
        conn.close(DisconnectReason::Kicked).await;
        Ok(())
    }

    /// Close every connection and cancel all background work without
    /// waiting. Safe to call repeatedly; dropping the server does the same.
    pub fn dispose(&self) {
        self.core.dispose();
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

    pub fn status(&self) -> ServerStatus {
        self.core.state.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == ServerStatus::Running
    }

    /// Actual bound address while running. Useful after binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.state.lock().local_addr
    }

    /// Snapshot of the active connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.core.connections.iter().map(|entry| entry.value().info()).collect()
    }

    pub fn connection(&self, id: &str) -> Option<ConnectionInfo> {
        self.core.connection(id).map(|conn| conn.info())
    }

    pub fn connection_count(&self) -> usize {
        self.core.connections.len()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.core.config
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("id", &self.core.id)
            .field("status", &self.status())
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Accept loop and connection handlers
// ─────────────────────────────────────────────────────────────────────────────

impl ServerCore {
    fn connection(&self, id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Clone the registry's handles so no shard lock is held across an await.
    fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|entry| entry.value().clone()).collect()
    }

    async fn send_to(&self, conn: &Arc<ClientConnection>, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let limit = self.config.socket.send_timeout_duration();
        match conn.send(data, limit).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Send to {} failed: {err}", conn.id());
                conn.close(DisconnectReason::SendFailed(err.to_string())).await;
                Err(err)
            }
        }
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        run_token: CancellationToken,
        accept_token: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = accept_token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Some(max) = self.config.max_connections {
                        if self.handlers.len() >= max {
                            warn!("Connection from {peer} rejected: max connections reached ({max})");
                            drop(stream);
                            continue;
                        }
                    }
                    let core = self.clone();
                    let token = run_token.child_token();
                    self.handlers.spawn(async move { core.handle_connection(stream, token).await });
                }
                Err(e) => {
                    warn!("Server {} accept error: {e}", self.id);
                    self.events
                        .emit(LinkEvent::error(&self.id, format!("accept failed: {e}"), Some(e.into())));
                    tokio::select! {
                        _ = accept_token.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        debug!("Server {} accept loop exited", self.id);
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, token: CancellationToken) {
        if let Err(e) = stream.set_nodelay(self.config.socket.no_delay) {
            debug!("Failed to set TCP_NODELAY: {e}");
        }
        let local = endpoint_string(stream.local_addr());
        let remote = endpoint_string(stream.peer_addr());
        let (mut reader, writer) = stream.into_split();

        let conn = Arc::new(ClientConnection::new(writer, local, remote, token));
        let id = conn.id().to_string();
        self.connections.insert(id.clone(), conn.clone());
        info!("Client connected: {id} ({}) (total: {})", conn.remote_address(), self.connections.len());
        self.events.emit(LinkEvent::connected(&id, conn.remote_address()));

        let reason = self.pump(&conn, &mut reader).await;

        // Removal precedes disposal of the socket
        let removed = self.connections.remove(&id).is_some();
        conn.dispose().await;
        drop(reader);
        if removed {
            info!("Client disconnected: {id} ({reason}) (total: {})", self.connections.len());
            self.events.emit(LinkEvent::disconnected(&id, reason));
        }
        conn.mark_finished();
    }

    /// Read until the connection ends, returning why it ended.
    async fn pump(&self, conn: &ClientConnection, reader: &mut OwnedReadHalf) -> DisconnectReason {
        let poll_interval = self.config.poll_interval_duration();
        let idle_limit = self.config.socket.receive_timeout_duration();
        let mut buffer = vec![0u8; self.config.socket.receive_buffer_size];
        let mut last_data = Instant::now();

        loop {
            let ready = tokio::select! {
                _ = conn.cancelled() => {
                    return conn.take_close_reason().unwrap_or(DisconnectReason::ServerStopping);
                }
                ready = tokio::time::timeout(poll_interval, reader.readable()) => ready,
            };

            match ready {
                // Poll interval elapsed without data
                Err(_) => {
                    if let Some(reason) = check_liveness(conn, reader) {
                        return reason;
                    }
                    if let Some(limit) = idle_limit {
                        if last_data.elapsed() >= limit {
                            return DisconnectReason::Transport(format!("no data received for {limit:?}"));
                        }
                    }
                }
                Ok(Err(e)) => return DisconnectReason::Transport(e.to_string()),
                Ok(Ok(())) => match reader.try_read(&mut buffer) {
                    Ok(0) => return DisconnectReason::RemoteClosed,
                    Ok(n) => {
                        last_data = Instant::now();
                        self.events.emit(LinkEvent::data_received(
                            conn.id(),
                            bytes::Bytes::copy_from_slice(&buffer[..n]),
                        ));
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                        ) => {}
                    Err(e) => return DisconnectReason::Transport(e.to_string()),
                },
            }
        }
    }

    fn dispose(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        for entry in self.connections.iter() {
            entry.value().request_close(DisconnectReason::Shutdown);
        }
        self.shutdown.cancel();
        {
            let mut state = self.state.lock();
            state.run = None;
            state.local_addr = None;
            state.status = ServerStatus::Stopped;
        }
        debug!("Server {} disposed", self.id);
    }
}

/// Non-blocking check for a dead peer: a pending socket error, or a write
/// that already failed on this connection.
fn check_liveness(conn: &ClientConnection, reader: &OwnedReadHalf) -> Option<DisconnectReason> {
    if !conn.is_alive() {
        return Some(DisconnectReason::LivenessLost("connection marked dead".into()));
    }
    match reader.as_ref().take_error() {
        Ok(None) => None,
        Ok(Some(e)) | Err(e) => Some(DisconnectReason::LivenessLost(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use tcplink_core::SocketConfig;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    use super::*;

    async fn running_server() -> (TcpServer, SocketAddr) {
        let server = TcpServer::new(ServerConfig::default().poll_interval(Duration::from_millis(20)));
        server.start("127.0.0.1", 0, 16).await.unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    async fn wait_for_count(server: &TcpServer, count: usize) {
        timeout(Duration::from_secs(5), async {
            while server.connection_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Timeout waiting for connection count");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn broadcast_reports_dead_connection_but_delivers_to_rest() {
        let (server, addr) = running_server().await;
        let mut peers = Vec::new();
        for _ in 0..3 {
            peers.push(TcpStream::connect(addr).await.unwrap());
        }
        wait_for_count(&server, 3).await;

        // Break one registered connection's write half
        let dead = server.core.snapshot().remove(0);
        dead.poison_writer().await;

        let err = server.broadcast(b"tick").await.unwrap_err();
        assert!(matches!(err, LinkError::BroadcastIncomplete { failed: 1, total: 3 }), "got {err}");
        assert!(server.connection(dead.id()).is_none());
        assert_eq!(server.connection_count(), 2);

        // Exactly two peers see the payload; the dead one sees EOF
        let mut delivered = 0;
        for peer in &mut peers {
            let mut buf = [0u8; 4];
            let n = timeout(Duration::from_secs(5), peer.read(&mut buf)).await.unwrap().unwrap();
            if n > 0 {
                assert_eq!(&buf[..n], b"tick");
                delivered += 1;
            }
        }
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn liveness_check_detects_dead_flag() {
        let (server, addr) = running_server().await;
        let mut events = server.subscribe();
        let _peer = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;

        let conn = server.core.snapshot().remove(0);
        conn.mark_dead();

        let reason = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(LinkEvent::Disconnected(e)) = events.recv().await {
                    return e.reason;
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(reason, DisconnectReason::LivenessLost(_)), "got {reason:?}");
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn max_connections_rejects_extra_sockets() {
        let server = TcpServer::new(ServerConfig::default().max_connections(1));
        server.start("127.0.0.1", 0, 4).await.unwrap();
        let addr = server.local_addr().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), second.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn start_twice_is_invalid_state() {
        let (server, _) = running_server().await;
        let err = server.start("127.0.0.1", 0, 4).await.unwrap_err();
        assert!(matches!(err, LinkError::InvalidState { .. }));
        assert_eq!(server.status(), ServerStatus::Running);
    }

    #[tokio::test]
    async fn dispose_stops_the_server() {
        let (server, addr) = running_server().await;
        let mut peer = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;

        server.dispose();
        server.dispose();
        assert_eq!(server.status(), ServerStatus::Stopped);

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), peer.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0);
        assert!(matches!(server.start("127.0.0.1", 0, 4).await, Err(LinkError::Disposed)));
    }

    #[tokio::test]
    async fn idle_limit_closes_silent_connection() {
        let config = ServerConfig::default()
            .poll_interval(Duration::from_millis(20))
            .socket_config(SocketConfig::default().receive_timeout(Duration::from_millis(150)));
        let server = TcpServer::new(config);
        let mut events = server.subscribe();
        server.start("127.0.0.1", 0, 4).await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut peer = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;

        let reason = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(LinkEvent::Disconnected(e)) = events.recv().await {
                    return e.reason;
                }
            }
        })
        .await
        .expect("Timeout waiting for idle disconnect");
        assert!(matches!(reason, DisconnectReason::Transport(ref msg) if msg.contains("no data")), "got {reason:?}");
        assert_eq!(server.connection_count(), 0);

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), peer.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[test]
    fn zero_poll_interval_falls_back_to_default() {
        let config = ServerConfig {
            poll_interval_ms: 0,
            socket: SocketConfig {
                send_buffer_size: 0,
                ..SocketConfig::default()
            },
            ..ServerConfig::default()
        };
        let server = TcpServer::new(config);
        assert_eq!(server.config().poll_interval_ms, 100);
        assert_eq!(server.config().socket.send_buffer_size, 8192);
    }
}
