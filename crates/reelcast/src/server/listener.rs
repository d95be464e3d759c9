//! TCP accept loop

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::heartbeat::{self, HeartbeatConfig};
use super::registry::ConnectionRegistry;
use crate::transport::ClientConnection;
use crate::{ServerError, DEFAULT_PORT, DEFAULT_WRITE_TIMEOUT};

/// Listener configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub heartbeat: HeartbeatConfig,
    /// Longest a single write to one client may stall before it is dropped
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            heartbeat: HeartbeatConfig::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Accepts clients, registers them and starts their heartbeat
pub struct Server {
    listener: TcpListener,
    registry: ConnectionRegistry,
    config: ServerConfig,
}

impl Server {
    /// Bind the listening socket.
    pub async fn bind(config: ServerConfig, registry: ConnectionRegistry) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        Ok(Self {
            listener,
            registry,
            config,
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Accept until `cancel` fires or accepting fails.
    ///
    /// Per-connection workers are spawned on `tracker`. On cancellation
    /// every client is sent `QUIT` and removed.
    pub async fn run(self, cancel: CancellationToken, tracker: TaskTracker) -> Result<(), ServerError> {
        match self.listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "Listening"),
            Err(e) => debug!(error = %e, "Local address unavailable"),
        }

        let result = loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.admit(stream, peer, &tracker).await,
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "Accept failed; continuing");
                }
                Err(e) => break Err(ServerError::Accept(e)),
            }
        };

        info!("Accept loop: shutting down");
        self.registry.quit_all().await;
        result
    }

    async fn admit(&self, stream: tokio::net::TcpStream, peer: SocketAddr, tracker: &TaskTracker) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        let conn = Arc::new(
            ClientConnection::new(self.registry.next_id(), peer, Box::new(writer))
                .with_write_timeout(self.config.write_timeout),
        );
        self.registry.add(Arc::clone(&conn)).await;

        tracker.spawn(heartbeat::supervise(
            conn,
            Box::new(reader),
            self.registry.clone(),
            self.config.heartbeat,
        ));
    }
}

/// Per-connection accept errors that do not mean the listener is broken
fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock
    )
}
