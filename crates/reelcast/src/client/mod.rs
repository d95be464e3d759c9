//! Receiving side
//!
//! [`ClientDispatcher`] reads messages from a capture node, answers
//! heartbeats and stores received files. Archives can then be unpacked
//! with [`extract_archive`].

mod dispatcher;
mod extract;

pub use dispatcher::{
    remove_partial_files, ClientDispatcher, DispatchEvent, DispatcherState, ReceivedFile,
};
pub use extract::{extract_archive, is_archive, is_video_file, list_videos, VIDEO_EXTENSIONS};

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::DEFAULT_PORT;

/// Subdirectory of the save directory archives are extracted into
pub const EXTRACT_SUBDIR: &str = "extracted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    /// Where received files are written
    pub save_dir: PathBuf,
    /// Unpack received `.zip` files into `<save_dir>/extracted`
    pub extract_archives: bool,
}

impl ClientConfig {
    pub fn extract_dir(&self) -> PathBuf {
        self.save_dir.join(EXTRACT_SUBDIR)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            save_dir: PathBuf::from("downloads"),
            extract_archives: true,
        }
    }
}
