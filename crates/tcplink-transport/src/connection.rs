//! Server-side connection state tracking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tcplink_core::{DisconnectReason, LinkError, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::sync::CancellationToken;

use crate::socket::write_all_bounded;

/// Read-only snapshot of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: String,
    pub remote_address: String,
    pub local_address: String,
    pub connected_at: DateTime<Utc>,
    pub is_alive: bool,
}

/// One accepted client socket.
///
/// The connection handler task owns the read half. The write half sits
/// behind the send lock so concurrent senders never interleave.
#[derive(Debug)]
pub(crate) struct ClientConnection {
    /// Unique connection ID
    id: String,
    remote_address: String,
    local_address: String,
    connected_at: DateTime<Utc>,
    /// Cleared on the first failed write or when the handler disposes the socket
    alive: AtomicBool,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    close_reason: Mutex<Option<DisconnectReason>>,
    /// Cancelled to ask the handler to stop
    cancel: CancellationToken,
    /// Cancelled by the handler once the connection is removed and disposed
    finished: CancellationToken,
}

impl ClientConnection {
    pub(crate) fn new(
        writer: OwnedWriteHalf,
        local_address: String,
        remote_address: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_address,
            local_address,
            connected_at: Utc::now(),
            alive: AtomicBool::new(true),
            writer: tokio::sync::Mutex::new(Some(writer)),
            close_reason: Mutex::new(None),
            cancel,
            finished: CancellationToken::new(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            remote_address: self.remote_address.clone(),
            local_address: self.local_address.clone(),
            connected_at: self.connected_at,
            is_alive: self.is_alive(),
        }
    }

    /// Write the whole buffer while holding the send lock.
    ///
    /// Aborts with `NotConnected` if the connection is closed mid-write.
    pub(crate) async fn send(&self, data: &[u8], limit: Option<Duration>) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        let result = tokio::select! {
            result = write_all_bounded(writer, data, limit) => result,
            _ = self.cancel.cancelled() => Err(LinkError::NotConnected),
        };
        if result.is_err() {
            self.alive.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Ask the handler to end this connection. The first recorded reason wins.
    pub(crate) fn request_close(&self, reason: DisconnectReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    /// Request close and wait until the handler has finished teardown.
    pub(crate) async fn close(&self, reason: DisconnectReason) {
        self.request_close(reason);
        self.finished.cancelled().await;
    }

    pub(crate) fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn take_close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason.lock().take()
    }

    /// Abort in-flight sends and shut the write half down.
    pub(crate) async fn dispose(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }

    #[cfg(test)]
    pub(crate) async fn poison_writer(&self) {
        self.writer.lock().await.take();
    }

    #[cfg(test)]
    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}
