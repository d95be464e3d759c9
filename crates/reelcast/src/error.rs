//! Error taxonomy for the distribution subsystem
//!
//! Per-connection errors (`Framing`, `Protocol`, `Transfer`, `Connection`)
//! are contained to the connection they occur on. `Recording` and `Bundle`
//! errors surface to whoever issued the recording command.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::TAG_LEN;

/// A fixed-size field could not be read in full, or its contents are invalid.
#[derive(Debug, Error)]
pub enum FramingError {
    /// The stream ended part-way through a fixed-size field
    #[error("truncated {field}: got {received} of {expected} bytes")]
    Truncated {
        field: &'static str,
        expected: usize,
        received: usize,
    },
    /// The announced file name is longer than the protocol allows
    #[error("file name length {0} exceeds limit")]
    NameTooLong(u32),
    /// The file name bytes are not UTF-8
    #[error("file name is not valid UTF-8")]
    InvalidName(#[from] std::string::FromUtf8Error),
    /// The file name is empty or not a bare file name
    #[error("unusable file name {0:?}")]
    UnsafeName(String),
    /// Underlying read failed
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// The bytes in tag position are not a known tag.
///
/// The protocol has no resynchronization marker, so the connection is closed.
#[derive(Debug, Error)]
#[error("unrecognized tag {}", String::from_utf8_lossy(.0).escape_debug())]
pub struct ProtocolError(pub [u8; TAG_LEN]);

/// A payload stream stopped before the announced size was delivered.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Peer closed mid-payload
    #[error("peer closed during {name}: received {received} of {expected} bytes")]
    PeerClosed {
        name: String,
        expected: u64,
        received: u64,
    },
    /// Reading the payload from the peer failed
    #[error("read failed during {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: io::Error,
    },
    /// Writing the payload to its destination failed
    #[error("failed to write {path:?}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The connection itself is unusable.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Send or receive failed (reset, broken pipe, ...)
    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),
    /// Peer closed the connection
    #[error("connection closed by peer")]
    Closed,
    /// Peer did not answer a heartbeat in time
    #[error("no heartbeat reply within {0:?}")]
    HeartbeatTimeout(std::time::Duration),
}

/// Everything that can end a receiving dispatcher loop abnormally.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Recording commands that could not be carried out.
#[derive(Debug, Error)]
pub enum RecordingError {
    /// The session sink could not be opened; the controller stays `Idle`
    #[error("failed to open session sink {path:?}: {source}")]
    OpenSink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The session sink could not be closed cleanly
    #[error("failed to close session sink: {0}")]
    CloseSink(#[source] io::Error),
    /// The session finished but bundling failed
    #[error(transparent)]
    Bundle(#[from] BundleError),
}

/// Archive creation or inspection failed.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("archive I/O on {path:?} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("archive {path:?} is invalid: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
}

/// Fatal listener errors. Nothing else stops the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}
