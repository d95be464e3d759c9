//! Registry of live client connections
//!
//! The only state mutated from several workers at once. All mutation goes
//! through one lock; iteration happens on a copied snapshot so that a slow
//! broadcast never holds the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::transport::{ClientConnection, ConnectionId};

/// Registry counters (snapshot)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub connected: usize,
    pub total_added: u64,
    pub total_removed: u64,
}

struct AtomicRegistryStats {
    total_added: AtomicU64,
    total_removed: AtomicU64,
}

struct RegistryInner {
    connections: RwLock<Vec<Arc<ClientConnection>>>,
    next_id: AtomicU64,
    stats: AtomicRegistryStats,
}

/// Shared handle to the set of connected clients. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                stats: AtomicRegistryStats {
                    total_added: AtomicU64::new(0),
                    total_removed: AtomicU64::new(0),
                },
            }),
        }
    }

    /// Allocate an id for a connection about to be added.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a newly accepted connection.
    pub async fn add(&self, conn: Arc<ClientConnection>) {
        let id = conn.id();
        let addr = conn.remote_addr();
        let count = {
            let mut connections = self.inner.connections.write().await;
            connections.push(conn);
            connections.len()
        };
        self.inner.stats.total_added.fetch_add(1, Ordering::Relaxed);
        info!(conn = %id, peer = %addr, clients = count, "Client registered");
    }

    /// Remove a connection and close it.
    ///
    /// Removing an absent connection is a no-op. Returns whether an entry
    /// was removed. The write half is shut down in the background so the
    /// caller never waits on an in-flight transfer.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut connections = self.inner.connections.write().await;
            let removed = connections
                .iter()
                .position(|c| c.id() == id)
                .map(|idx| connections.remove(idx));
            (removed, connections.len())
        };

        let Some(conn) = removed else {
            debug!(conn = %id, "Remove skipped: not registered");
            return false;
        };

        self.inner.stats.total_removed.fetch_add(1, Ordering::Relaxed);
        conn.mark_closed();
        info!(conn = %id, peer = %conn.remote_addr(), clients = count, "Client removed");
        tokio::spawn(async move { conn.shutdown().await });
        true
    }

    /// Copy of the current membership, in registration order.
    pub async fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.inner.connections.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner
            .connections
            .read()
            .await
            .iter()
            .any(|c| c.id() == id)
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            connected: self.count().await,
            total_added: self.inner.stats.total_added.load(Ordering::Relaxed),
            total_removed: self.inner.stats.total_removed.load(Ordering::Relaxed),
        }
    }

    /// Send `QUIT` to every client and remove them all.
    ///
    /// Clients are notified concurrently. Each `QUIT` is bounded by that
    /// connection's write timeout and the client is removed either way.
    pub async fn quit_all(&self) {
        let connections = self.snapshot().await;
        join_all(connections.into_iter().map(|conn| async move {
            if let Err(e) = conn.send_quit().await {
                debug!(conn = %conn.id(), error = %e, "QUIT not delivered");
            }
            self.remove(conn.id()).await;
        }))
        .await;
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
