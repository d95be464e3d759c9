//! File-backed capture pipeline

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::recording::{CapturePipeline, SessionFile};

struct OpenSession {
    path: PathBuf,
    writer: BufWriter<File>,
    frames: u64,
}

/// Appends raw frames to the current session file.
///
/// Every session that was closed cleanly and holds at least one frame is
/// reported by [`CapturePipeline::current_session_files`]; sessions without
/// frames are deleted on close.
#[derive(Default)]
pub struct FileCapture {
    current: Option<OpenSession>,
    finished: Vec<SessionFile>,
}

impl FileCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Append one frame to the open session.
    ///
    /// Returns `Ok(false)` when no session is open and the frame was dropped.
    pub fn write_frame(&mut self, frame: &[u8]) -> io::Result<bool> {
        let Some(session) = self.current.as_mut() else {
            return Ok(false);
        };
        session.writer.write_all(frame)?;
        session.frames += 1;
        if session.frames % 300 == 0 {
            debug!(frames = session.frames, path = ?session.path, "Capture progress");
        }
        Ok(true)
    }
}

impl CapturePipeline for FileCapture {
    fn on_start(&mut self, output_path: &Path) -> io::Result<()> {
        if let Some(mut stale) = self.current.take() {
            stale.writer.flush()?;
        }
        let file = File::create(output_path)?;
        self.current = Some(OpenSession {
            path: output_path.to_path_buf(),
            writer: BufWriter::new(file),
            frames: 0,
        });
        Ok(())
    }

    fn on_stop(&mut self) -> io::Result<()> {
        let Some(session) = self.current.take() else {
            return Ok(());
        };
        let file = session.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        if session.frames == 0 {
            std::fs::remove_file(&session.path)?;
            info!(path = ?session.path, "Empty session discarded");
            return Ok(());
        }

        let finished = SessionFile::from_path(&session.path)?;
        info!(
            path = ?finished.path,
            frames = session.frames,
            size = finished.size_bytes,
            "Session closed"
        );
        self.finished.push(finished);
        Ok(())
    }

    fn current_session_files(&self) -> Vec<SessionFile> {
        self.finished.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_without_session_are_dropped() {
        let mut capture = FileCapture::new();
        assert!(!capture.write_frame(b"lost").unwrap());
        assert!(capture.current_session_files().is_empty());
    }

    #[test]
    fn closed_session_is_reported_with_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video_1.avi");
        let mut capture = FileCapture::new();

        capture.on_start(&path).unwrap();
        assert!(capture.is_open());
        capture.write_frame(&[1u8; 1000]).unwrap();
        capture.write_frame(&[2u8; 234]).unwrap();
        assert!(capture.current_session_files().is_empty(), "open session not listed");

        capture.on_stop().unwrap();
        assert!(!capture.is_open());
        assert_eq!(
            capture.current_session_files(),
            vec![SessionFile::new(&path, 1234)]
        );
    }

    #[test]
    fn session_without_frames_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video_empty.avi");
        let mut capture = FileCapture::new();

        capture.on_start(&path).unwrap();
        capture.on_stop().unwrap();
        assert!(!path.exists());
        assert!(capture.current_session_files().is_empty());
    }

    #[test]
    fn unopenable_sink_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = FileCapture::new();
        let err = capture
            .on_start(&dir.path().join("missing").join("video.avi"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!capture.is_open());
    }
}
