//! Receiving loop for one server connection
//!
//! ```text
//! AwaitTag ──FILE──▶ FileReceive ──ok──▶ AwaitTag
//!    │  └────PING──▶ HeartbeatReply ───▶ AwaitTag
//!    └──QUIT / EOF / error ─────────────▶ Closed
//! ```
//!
//! An unknown tag closes the connection: the protocol has no way to find
//! the next message boundary.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::transport::codec::{read_file_header, read_tag};
use crate::transport::{FileHeader, Tag};
use crate::{ConnectionError, FramingError, ReceiveError, TransferError, CHUNK_SIZE, PONG};

const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    AwaitTag,
    FileReceive,
    HeartbeatReply,
    Closed,
}

/// A file written to disk in full
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
}

/// What one step of the dispatcher did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    FileReceived(ReceivedFile),
    /// Server reported the file as unavailable (`payload_size == 0`)
    TransferAborted,
    /// Payload skipped because its name cannot be used as a local file name
    Rejected { size_bytes: u64 },
    /// Answered a heartbeat probe
    Pong,
    /// Server sent `QUIT`
    Quit,
    /// Connection is closed; no further events
    Closed,
}

/// Dispatches incoming messages and stores received files in `save_dir`
pub struct ClientDispatcher<R, W> {
    reader: R,
    writer: W,
    save_dir: PathBuf,
    state: DispatcherState,
    buf: Vec<u8>,
}

impl ClientDispatcher<OwnedReadHalf, OwnedWriteHalf> {
    /// Connect to a capture node.
    pub async fn connect(addr: impl ToSocketAddrs, save_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(server = %stream.peer_addr()?, "Connected");
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer, save_dir))
    }
}

impl<R, W> ClientDispatcher<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, save_dir: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            writer,
            save_dir: save_dir.into(),
            state: DispatcherState::AwaitTag,
            buf: vec![0u8; CHUNK_SIZE],
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    /// Handle exactly one message.
    ///
    /// Any error leaves the dispatcher `Closed`.
    pub async fn next_event(&mut self) -> Result<DispatchEvent, ReceiveError> {
        if self.state == DispatcherState::Closed {
            return Ok(DispatchEvent::Closed);
        }
        let result = self.step().await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    /// Dispatch until the connection closes, calling `on_file` for every
    /// file received.
    pub async fn run<F>(&mut self, mut on_file: F) -> Result<(), ReceiveError>
    where
        F: FnMut(&ReceivedFile),
    {
        loop {
            match self.next_event().await? {
                DispatchEvent::FileReceived(file) => on_file(&file),
                DispatchEvent::Quit | DispatchEvent::Closed => return Ok(()),
                _ => {}
            }
        }
    }

    async fn step(&mut self) -> Result<DispatchEvent, ReceiveError> {
        self.state = DispatcherState::AwaitTag;
        let Some(tag) = read_tag(&mut self.reader).await? else {
            info!("Server closed the connection");
            self.close().await;
            return Ok(DispatchEvent::Closed);
        };

        match tag {
            Tag::Ping => {
                self.state = DispatcherState::HeartbeatReply;
                self.writer
                    .write_all(PONG)
                    .await
                    .map_err(ConnectionError::Io)?;
                self.writer.flush().await.map_err(ConnectionError::Io)?;
                self.state = DispatcherState::AwaitTag;
                debug!("Heartbeat answered");
                Ok(DispatchEvent::Pong)
            }
            Tag::Quit => {
                info!("Server sent QUIT");
                self.close().await;
                Ok(DispatchEvent::Quit)
            }
            Tag::File => {
                self.state = DispatcherState::FileReceive;
                let event = self.receive_file().await?;
                self.state = DispatcherState::AwaitTag;
                Ok(event)
            }
        }
    }

    async fn receive_file(&mut self) -> Result<DispatchEvent, ReceiveError> {
        let Some(header) = read_file_header(&mut self.reader).await? else {
            warn!("Server reported file unavailable");
            return Ok(DispatchEvent::TransferAborted);
        };

        let name = match header.file_name() {
            Ok(name) => name,
            Err(e @ (FramingError::UnsafeName(_) | FramingError::InvalidName(_))) => {
                warn!(error = %e, size = header.payload_size, "Skipping file with unusable name");
                self.discard_payload(&header).await?;
                return Ok(DispatchEvent::Rejected {
                    size_bytes: header.payload_size,
                });
            }
            Err(e) => return Err(e.into()),
        };

        info!(name = %name, size = header.payload_size, "Receiving file");
        let file = self.store_payload(&name, header.payload_size).await?;
        info!(path = ?file.path, size = file.size_bytes, "File received");
        Ok(DispatchEvent::FileReceived(file))
    }

    /// Stream the payload to `<save_dir>/<name>.part`, then rename it into
    /// place. The partial file is removed on failure.
    async fn store_payload(&mut self, name: &str, size: u64) -> Result<ReceivedFile, TransferError> {
        let final_path = self.save_dir.join(name);
        let part_path = self.save_dir.join(format!("{name}{PARTIAL_SUFFIX}"));

        let result = self.write_part(name, &part_path, size).await;
        let result = match result {
            Ok(()) => fs::rename(&part_path, &final_path)
                .await
                .map_err(|source| TransferError::Sink {
                    path: final_path.clone(),
                    source,
                }),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_file(&part_path).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(path = ?part_path, error = %cleanup, "Failed to remove partial file");
                }
            }
            return Err(e);
        }

        Ok(ReceivedFile {
            path: final_path,
            name: name.to_string(),
            size_bytes: size,
        })
    }

    async fn write_part(&mut self, name: &str, part_path: &Path, size: u64) -> Result<(), TransferError> {
        let sink_err = |source: io::Error| TransferError::Sink {
            path: part_path.to_path_buf(),
            source,
        };

        fs::create_dir_all(&self.save_dir)
            .await
            .map_err(|source| TransferError::Sink {
                path: self.save_dir.clone(),
                source,
            })?;
        let mut out = File::create(part_path).await.map_err(sink_err)?;

        let mut received = 0u64;
        while received < size {
            let want = (size - received).min(self.buf.len() as u64) as usize;
            let n = match self.reader.read(&mut self.buf[..want]).await {
                Ok(0) => {
                    return Err(TransferError::PeerClosed {
                        name: name.to_string(),
                        expected: size,
                        received,
                    })
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(TransferError::Read {
                        name: name.to_string(),
                        source,
                    })
                }
            };
            out.write_all(&self.buf[..n]).await.map_err(sink_err)?;
            received += n as u64;
        }

        out.flush().await.map_err(sink_err)?;
        out.sync_all().await.map_err(sink_err)?;
        Ok(())
    }

    /// Read and drop a payload so the stream stays on a message boundary.
    async fn discard_payload(&mut self, header: &FileHeader) -> Result<(), TransferError> {
        let name = String::from_utf8_lossy(&header.raw_name).into_owned();
        let mut remaining = header.payload_size;
        while remaining > 0 {
            let want = remaining.min(self.buf.len() as u64) as usize;
            match self.reader.read(&mut self.buf[..want]).await {
                Ok(0) => {
                    return Err(TransferError::PeerClosed {
                        expected: header.payload_size,
                        received: header.payload_size - remaining,
                        name,
                    })
                }
                Ok(n) => remaining -= n as u64,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(TransferError::Read { name, source }),
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.state == DispatcherState::Closed {
            return;
        }
        self.state = DispatcherState::Closed;
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "Shutdown after close failed");
        }
    }
}

/// Delete leftover `*.part` files in `save_dir` from an interrupted
/// transfer. A missing directory counts as clean.
pub async fn remove_partial_files(save_dir: &Path) -> io::Result<usize> {
    let mut entries = match fs::read_dir(save_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let is_partial = entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX);
        if is_partial && entry.file_type().await?.is_file() {
            fs::remove_file(entry.path()).await?;
            debug!(path = ?entry.path(), "Removed partial file");
            removed += 1;
        }
    }
    Ok(removed)
}
