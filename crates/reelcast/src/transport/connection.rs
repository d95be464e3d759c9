//! Server-side handle to one connected client
//!
//! The write half lives behind an async mutex so that a broadcast transfer
//! and a heartbeat probe never interleave bytes on the same stream. The
//! read half is handed to the heartbeat supervisor, which is the only
//! reader on the server side.
//!
//! Every write is bounded by the connection's write timeout, so a peer that
//! stops reading fails its own writes instead of holding the writer forever.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::codec::{within, write_file, write_file_unavailable, write_tag, Tag};
use crate::DEFAULT_WRITE_TIMEOUT;

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Boxed write half of a client stream
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed read half of a client stream
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A live downstream connection
pub struct ClientConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    writer: Mutex<BoxedWriter>,
    write_timeout: Duration,
    alive: AtomicBool,
    cancel: CancellationToken,
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl ClientConnection {
    pub fn new(id: ConnectionId, remote_addr: SocketAddr, writer: BoxedWriter) -> Self {
        Self {
            id,
            remote_addr,
            writer: Mutex::new(writer),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            alive: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        }
    }

    /// Limit on how long any single write (or the wait for the writer) may
    /// stall before it fails with `TimedOut`.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Token cancelled when this connection is closed; per-connection
    /// workers select on it.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Send a heartbeat probe.
    ///
    /// Returns `Ok(false)` without writing when a transfer currently owns
    /// the writer; that transfer is already bounded by the write timeout.
    pub async fn send_ping(&self) -> io::Result<bool> {
        self.ensure_alive()?;
        let Ok(mut writer) = self.writer.try_lock() else {
            return Ok(false);
        };
        within(Some(self.write_timeout), write_tag(&mut *writer, Tag::Ping)).await?;
        Ok(true)
    }

    /// Tell the peer we are closing.
    pub async fn send_quit(&self) -> io::Result<()> {
        self.ensure_alive()?;
        let limit = Some(self.write_timeout);
        within(limit, async {
            let mut writer = self.writer.lock().await;
            write_tag(&mut *writer, Tag::Quit).await
        })
        .await
    }

    /// Send a complete `FILE` message, holding the writer for its whole duration.
    ///
    /// Each write inside the transfer is bounded separately, so a slow but
    /// progressing peer may take as long as it needs.
    pub async fn send_file<R, F>(
        &self,
        name: &str,
        payload_size: u64,
        source: &mut R,
        on_progress: F,
    ) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        F: FnMut(u64),
    {
        self.ensure_alive()?;
        let mut writer = self.lock_writer().await?;
        let limit = Some(self.write_timeout);
        write_file(&mut *writer, name, payload_size, source, limit, on_progress).await
    }

    /// Send the reserved "file unavailable" report.
    pub async fn send_file_unavailable(&self) -> io::Result<()> {
        self.ensure_alive()?;
        let mut writer = self.lock_writer().await?;
        within(Some(self.write_timeout), write_file_unavailable(&mut *writer)).await
    }

    /// Mark dead and stop per-connection workers. Returns `false` if it was
    /// already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        self.cancel.cancel();
        was_alive
    }

    /// Shut down the write half once any in-flight write has finished or
    /// timed out.
    pub(crate) async fn shutdown(&self) {
        let _ = within(Some(self.write_timeout), async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        })
        .await;
    }

    async fn lock_writer(&self) -> io::Result<MutexGuard<'_, BoxedWriter>> {
        within(Some(self.write_timeout), async {
            Ok(self.writer.lock().await)
        })
        .await
    }

    fn ensure_alive(&self) -> io::Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection {} is closed", self.id),
            ))
        }
    }
}
