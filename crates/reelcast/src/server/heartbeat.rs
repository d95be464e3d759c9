//! Per-connection liveness probing
//!
//! Every `interval` the supervisor sends `PING` and waits for any non-empty
//! reply. A failed send, a closed read side or (when enabled) a missing
//! reply removes the connection from the registry. While a transfer owns
//! the writer the probe is skipped; the transfer's own write timeout
//! evicts a peer that stops reading.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::registry::ConnectionRegistry;
use crate::transport::{BoxedReader, ClientConnection};
use crate::{ConnectionError, DEFAULT_PING_INTERVAL};

/// Size of the buffer replies are read into
const REPLY_BUF_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between probes
    pub interval: Duration,
    /// How long to wait for a reply; `None` waits forever
    pub reply_timeout: Option<Duration>,
}

impl HeartbeatConfig {
    /// Probe every `interval`, expecting a reply within twice that.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            reply_timeout: Some(interval * 2),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::with_interval(DEFAULT_PING_INTERVAL)
    }
}

/// Probe `conn` until it fails or is closed elsewhere, then make sure it is
/// out of the registry.
pub async fn supervise(
    conn: Arc<ClientConnection>,
    mut reader: BoxedReader,
    registry: ConnectionRegistry,
    config: HeartbeatConfig,
) {
    let id = conn.id();
    debug!(conn = %id, ?config, "Heartbeat started");

    let reason = tokio::select! {
        _ = conn.cancelled() => None,
        err = probe_loop(&conn, &mut reader, config) => Some(err),
    };

    match reason {
        Some(ConnectionError::Closed) => info!(conn = %id, "Client disconnected"),
        Some(e) => warn!(conn = %id, error = %e, "Heartbeat failed"),
        None => debug!(conn = %id, "Heartbeat stopped: connection closed"),
    }
    registry.remove(id).await;
}

async fn probe_loop(
    conn: &ClientConnection,
    reader: &mut BoxedReader,
    config: HeartbeatConfig,
) -> ConnectionError {
    let mut ticker = time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = [0u8; REPLY_BUF_LEN];

    loop {
        ticker.tick().await;

        match conn.send_ping().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(conn = %conn.id(), "Heartbeat skipped: transfer in progress");
                continue;
            }
            Err(e) => return ConnectionError::Io(e),
        }

        let read = reader.read(&mut buf);
        let result = match config.reply_timeout {
            Some(limit) => match time::timeout(limit, read).await {
                Ok(result) => result,
                Err(_) => return ConnectionError::HeartbeatTimeout(limit),
            },
            None => read.await,
        };

        match result {
            Ok(0) => return ConnectionError::Closed,
            Ok(n) => debug!(conn = %conn.id(), bytes = n, "Heartbeat reply"),
            Err(e) => return ConnectionError::Io(e),
        }
    }
}
