//! Bundle broadcast to every connected client
//!
//! [`Broadcaster`] performs one broadcast against a registry snapshot.
//! [`BroadcastWorker`] owns the send loop: the capture side hands bundles to
//! it through a [`BroadcastHandle`] and never waits on the network.
//!
//! The hand-off is a depth-one, latest-wins mailbox. While a broadcast is
//! running, a newer request replaces any request still waiting; only the
//! newest waiting bundle goes out next. Broadcasts never overlap.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::io::BufReader;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::ConnectionRegistry;
use crate::recording::Bundle;
use crate::transport::{ClientConnection, ConnectionId};
use crate::CHUNK_SIZE;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_millis(500);

/// How one transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The whole archive was written to the connection
    Delivered { bytes: u64 },
    /// The archive could not be read; the peer got the "file unavailable"
    /// report instead
    Unavailable,
    /// Sending failed; the connection was removed from the registry
    Failed { bytes_sent: u64, error: String },
}

/// One (bundle, connection) transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    pub conn: ConnectionId,
    pub outcome: TransferOutcome,
    pub elapsed: Duration,
}

/// Result of one broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub archive_path: PathBuf,
    pub transfers: Vec<TransferSession>,
}

impl BroadcastReport {
    pub fn delivered(&self) -> usize {
        self.count(|o| matches!(o, TransferOutcome::Delivered { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TransferOutcome::Failed { .. }))
    }

    pub fn unavailable(&self) -> usize {
        self.count(|o| matches!(o, TransferOutcome::Unavailable))
    }

    fn count(&self, pred: impl Fn(&TransferOutcome) -> bool) -> usize {
        self.transfers.iter().filter(|t| pred(&t.outcome)).count()
    }
}

/// Sends bundles to registry members, isolating per-client failures
#[derive(Clone)]
pub struct Broadcaster {
    registry: ConnectionRegistry,
}

impl Broadcaster {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Send `bundle` to every connection registered right now.
    pub async fn broadcast(&self, bundle: &Bundle) -> BroadcastReport {
        let targets = self.registry.snapshot().await;
        self.broadcast_to(bundle, targets).await
    }

    /// Send `bundle` to `targets`.
    ///
    /// Transfers run concurrently; each connection gets the whole archive
    /// as a single `FILE` message. A connection that fails is removed from
    /// the registry and does not affect the others.
    pub async fn broadcast_to(
        &self,
        bundle: &Bundle,
        targets: Vec<Arc<ClientConnection>>,
    ) -> BroadcastReport {
        let name = bundle.file_name();
        info!(
            archive = %name,
            size = bundle.size_bytes,
            clients = targets.len(),
            "Broadcast started"
        );

        let transfers =
            join_all(targets.iter().map(|conn| self.transfer(bundle, &name, conn))).await;

        let report = BroadcastReport {
            archive_path: bundle.archive_path.clone(),
            transfers,
        };
        info!(
            archive = %name,
            delivered = report.delivered(),
            failed = report.failed(),
            unavailable = report.unavailable(),
            "Broadcast finished"
        );
        report
    }

    async fn transfer(
        &self,
        bundle: &Bundle,
        name: &str,
        conn: &Arc<ClientConnection>,
    ) -> TransferSession {
        let started = Instant::now();
        let outcome = match self.send_archive(bundle, name, conn).await {
            Ok(outcome) => outcome,
            Err((bytes_sent, e)) => {
                warn!(conn = %conn.id(), peer = %conn.remote_addr(), error = %e, "Transfer failed");
                self.registry.remove(conn.id()).await;
                TransferOutcome::Failed {
                    bytes_sent,
                    error: e.to_string(),
                }
            }
        };
        TransferSession {
            conn: conn.id(),
            outcome,
            elapsed: started.elapsed(),
        }
    }

    async fn send_archive(
        &self,
        bundle: &Bundle,
        name: &str,
        conn: &ClientConnection,
    ) -> Result<TransferOutcome, (u64, std::io::Error)> {
        // Each transfer gets its own handle so concurrent readers never share a cursor
        let opened = match tokio::fs::File::open(&bundle.archive_path).await {
            Ok(file) => match file.metadata().await {
                Ok(meta) if meta.len() > 0 => Ok((file, meta.len())),
                Ok(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "archive is empty",
                )),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let (file, size) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!(conn = %conn.id(), archive = ?bundle.archive_path, error = %e, "Archive unreadable; reporting unavailable");
                conn.send_file_unavailable().await.map_err(|e| (0, e))?;
                return Ok(TransferOutcome::Unavailable);
            }
        };

        let id = conn.id();
        let mut sent = 0u64;
        let mut last_log = Instant::now();
        let started = Instant::now();
        let mut source = BufReader::with_capacity(CHUNK_SIZE, file);

        let result = conn
            .send_file(name, size, &mut source, |bytes| {
                sent = bytes;
                if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                    last_log = Instant::now();
                    let secs = started.elapsed().as_secs_f64().max(f64::EPSILON);
                    debug!(
                        conn = %id,
                        sent = bytes,
                        total = size,
                        percent = bytes as f64 * 100.0 / size as f64,
                        rate_kib_s = bytes as f64 / 1024.0 / secs,
                        "Transfer progress"
                    );
                }
            })
            .await;

        match result {
            Ok(bytes) => {
                info!(conn = %id, archive = %name, bytes, "Transfer complete");
                Ok(TransferOutcome::Delivered { bytes })
            }
            Err(e) => Err((sent, e)),
        }
    }
}

/// A submitted bundle and its submission number
#[derive(Clone)]
struct Pending {
    seq: u64,
    bundle: Arc<Bundle>,
}

/// Mailbox into the broadcast worker. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct BroadcastHandle {
    mailbox: Arc<watch::Sender<Option<Pending>>>,
    reports: broadcast::Sender<BroadcastReport>,
    submitted: Arc<AtomicU64>,
    settled: watch::Receiver<u64>,
}

impl BroadcastHandle {
    /// Queue `bundle` for broadcast, replacing any request not yet started.
    pub fn submit(&self, bundle: Bundle) {
        let name = bundle.file_name();
        let bundle = Arc::new(bundle);
        self.mailbox.send_modify(|slot| {
            let seq = self.submitted.fetch_add(1, Ordering::AcqRel) + 1;
            *slot = Some(Pending { seq, bundle });
        });
        debug!(archive = %name, "Broadcast requested");
    }

    /// Number of bundles handed to the worker so far
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Wait until everything submitted so far has either been broadcast or
    /// superseded by a broadcast that finished.
    ///
    /// Returns early if the worker has stopped.
    pub async fn settled(&self) {
        let target = self.submitted();
        let mut settled = self.settled.clone();
        let _ = settled.wait_for(|done| *done >= target).await;
    }

    /// Receive a report after each finished broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastReport> {
        self.reports.subscribe()
    }
}

/// Background task that runs broadcasts one at a time
pub struct BroadcastWorker;

impl BroadcastWorker {
    /// Spawn the worker. It exits when `cancel` fires.
    pub fn spawn(
        broadcaster: Broadcaster,
        cancel: CancellationToken,
    ) -> (BroadcastHandle, JoinHandle<()>) {
        let (tx, rx) = watch::channel(None);
        let (settled_tx, settled_rx) = watch::channel(0);
        let (reports, _) = broadcast::channel(16);
        let handle = BroadcastHandle {
            mailbox: Arc::new(tx),
            reports: reports.clone(),
            submitted: Arc::new(AtomicU64::new(0)),
            settled: settled_rx,
        };
        let task = tokio::spawn(Self::run(broadcaster, rx, reports, settled_tx, cancel));
        (handle, task)
    }

    async fn run(
        broadcaster: Broadcaster,
        mut mailbox: watch::Receiver<Option<Pending>>,
        reports: broadcast::Sender<BroadcastReport>,
        settled: watch::Sender<u64>,
        cancel: CancellationToken,
    ) {
        info!("Broadcast worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = mailbox.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let Some(Pending { seq, bundle }) = mailbox.borrow_and_update().clone() else {
                continue;
            };

            let report = tokio::select! {
                _ = cancel.cancelled() => break,
                report = broadcaster.broadcast(&bundle) => report,
            };
            settled.send_replace(seq);
            let _ = reports.send(report);
        }
        info!("Broadcast worker stopped");
    }
}
