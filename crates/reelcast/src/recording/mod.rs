//! Recording lifecycle and bundling
//!
//! - `RecordingController`: Idle → Recording → Finalizing → Idle
//! - `BundleBuilder`: archives finished sessions into one zip
//!
//! Session files are produced by a [`CapturePipeline`] and are read-only
//! here. Bundles are immutable once built; a later bundle supersedes an
//! earlier one rather than modifying it.

mod bundle;
mod controller;

pub use bundle::{ArchiveInfo, BundleBuilder, ARCHIVE_EXTENSION, ARCHIVE_PREFIX};
pub use controller::{CapturePipeline, RecordingController, RecordingState, StopReport};

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// A finished recording produced by the capture pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
        }
    }

    /// Describe an existing file on disk.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let size_bytes = std::fs::metadata(path)?.len();
        Ok(Self::new(path, size_bytes))
    }

    /// Bare file name, used as the archive member name
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// An archive of one or more finished sessions, ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub archive_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Local>,
    /// Members in archive order
    pub members: Vec<SessionFile>,
}

impl Bundle {
    /// Name the archive is announced under on the wire
    pub fn file_name(&self) -> String {
        self.archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
