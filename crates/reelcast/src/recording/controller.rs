//! Recording state machine
//!
//! `Idle → Recording` on [`RecordingController::start`],
//! `Recording → Finalizing → Idle` on [`RecordingController::stop`].
//! Finalizing is transient: `stop` always leaves the controller `Idle`,
//! whether or not bundling succeeded.
//!
//! The controller runs on the capture side's single thread of control and
//! never touches the network. Finished bundles are handed to the broadcast
//! worker through a [`BroadcastHandle`], which does not block.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use super::{Bundle, BundleBuilder, SessionFile};
use crate::server::BroadcastHandle;
use crate::{BundleError, RecordingError};

/// Recording lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    /// Only observable from inside `stop`
    Finalizing,
}

/// The capture pipeline as seen by the controller.
///
/// Implementations own the actual session sink (encoder, file handle, ...).
pub trait CapturePipeline: Send {
    /// Open a new session sink writing to `output_path`.
    fn on_start(&mut self, output_path: &Path) -> io::Result<()>;

    /// Close the current session sink.
    fn on_stop(&mut self) -> io::Result<()>;

    /// Every finished session the pipeline knows about, oldest first.
    fn current_session_files(&self) -> Vec<SessionFile>;
}

/// Outcome of a `stop` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReport {
    /// Controller was not recording; nothing happened
    NotRecording,
    /// Session closed; `bundle` is `None` when no new sessions existed
    Finished {
        duration: Duration,
        bundle: Option<Bundle>,
    },
}

/// Owns the process-wide recording state
pub struct RecordingController<P: CapturePipeline> {
    pipeline: P,
    builder: BundleBuilder,
    recordings_dir: PathBuf,
    state: RecordingState,
    started_at: Option<(Instant, DateTime<Local>)>,
    output_path: Option<PathBuf>,
    /// Sessions already included in a bundle
    bundled: HashSet<PathBuf>,
    broadcast: Option<BroadcastHandle>,
    auto_send: bool,
}

impl<P: CapturePipeline> RecordingController<P> {
    pub fn new(pipeline: P, recordings_dir: impl Into<PathBuf>, builder: BundleBuilder) -> Self {
        Self {
            pipeline,
            builder,
            recordings_dir: recordings_dir.into(),
            state: RecordingState::Idle,
            started_at: None,
            output_path: None,
            bundled: HashSet::new(),
            broadcast: None,
            auto_send: true,
        }
    }

    /// Hand finished bundles to this broadcast worker.
    pub fn with_broadcast(mut self, handle: BroadcastHandle) -> Self {
        self.broadcast = Some(handle);
        self
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }

    /// Wall-clock start of the current session
    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at.map(|(_, wall)| wall)
    }

    /// Elapsed time of the current session
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|(mono, _)| mono.elapsed())
    }

    /// Sink path of the current session
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    pub fn auto_send(&self) -> bool {
        self.auto_send
    }

    pub fn set_auto_send(&mut self, enabled: bool) {
        self.auto_send = enabled;
        info!(enabled, "Auto-send");
    }

    pub fn builder(&self) -> &BundleBuilder {
        &self.builder
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut P {
        &mut self.pipeline
    }

    /// Begin a new session.
    ///
    /// Returns the sink path, or `None` if already recording (no-op).
    /// On failure the controller stays `Idle`.
    pub fn start(&mut self) -> Result<Option<PathBuf>, RecordingError> {
        if self.state != RecordingState::Idle {
            debug!(state = ?self.state, "Start ignored: not idle");
            return Ok(None);
        }

        let wall = Local::now();
        let path = self.session_path(&wall);

        fs::create_dir_all(&self.recordings_dir).map_err(|source| RecordingError::OpenSink {
            path: path.clone(),
            source,
        })?;
        self.pipeline
            .on_start(&path)
            .map_err(|source| RecordingError::OpenSink {
                path: path.clone(),
                source,
            })?;

        self.started_at = Some((Instant::now(), wall));
        self.output_path = Some(path.clone());
        self.state = RecordingState::Recording;
        info!(path = ?path, "Recording started");
        Ok(Some(path))
    }

    /// End the current session and bundle everything recorded since the
    /// previous bundle.
    ///
    /// A no-op when not recording. The controller is `Idle` afterwards in
    /// every case, including errors.
    pub fn stop(&mut self) -> Result<StopReport, RecordingError> {
        if self.state != RecordingState::Recording {
            debug!(state = ?self.state, "Stop ignored: not recording");
            return Ok(StopReport::NotRecording);
        }

        self.state = RecordingState::Finalizing;
        let result = self.finalize();
        self.state = RecordingState::Idle;
        self.started_at = None;
        self.output_path = None;
        result
    }

    fn finalize(&mut self) -> Result<StopReport, RecordingError> {
        let closed = self.pipeline.on_stop();
        let duration = self.elapsed().unwrap_or_default();
        info!(duration_secs = duration.as_secs_f64(), "Recording stopped");
        closed.map_err(RecordingError::CloseSink)?;

        let pending: Vec<SessionFile> = self
            .pipeline
            .current_session_files()
            .into_iter()
            .filter(|s| !self.bundled.contains(&s.path))
            .collect();

        let bundle = self.builder.build(&pending)?;
        if let Some(ref bundle) = bundle {
            self.bundled
                .extend(bundle.members.iter().map(|m| m.path.clone()));
            self.hand_off(bundle.clone());
        }

        Ok(StopReport::Finished { duration, bundle })
    }

    /// Queue the newest archive on disk for broadcast.
    ///
    /// Returns the bundle that was queued, if any archive exists.
    pub fn send_latest(&self) -> Result<Option<Bundle>, BundleError> {
        let Some(bundle) = self.builder.latest_archive()? else {
            info!("No archives to send");
            return Ok(None);
        };
        match self.broadcast {
            Some(ref handle) => {
                handle.submit(bundle.clone());
            }
            None => warn!("No broadcaster attached; archive not sent"),
        }
        Ok(Some(bundle))
    }

    fn hand_off(&self, bundle: Bundle) {
        if !self.auto_send {
            debug!(path = ?bundle.archive_path, "Auto-send off; bundle kept locally");
            return;
        }
        if let Some(ref handle) = self.broadcast {
            handle.submit(bundle);
        }
    }

    fn session_path(&self, wall: &DateTime<Local>) -> PathBuf {
        let stamp = wall.format("%Y%m%d_%H%M%S_%3f");
        let mut path = self.recordings_dir.join(format!("video_{stamp}.avi"));
        let mut n = 1;
        while path.exists() {
            path = self.recordings_dir.join(format!("video_{stamp}_{n}.avi"));
            n += 1;
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FileCapture;
    use crate::server::{BroadcastWorker, Broadcaster, ConnectionRegistry};
    use tokio_util::sync::CancellationToken;

    /// Pipeline that records calls and can be told to fail
    #[derive(Default)]
    struct ScriptedPipeline {
        starts: usize,
        stops: usize,
        fail_start: bool,
        fail_stop: bool,
        files: Vec<SessionFile>,
    }

    impl CapturePipeline for ScriptedPipeline {
        fn on_start(&mut self, _output_path: &Path) -> io::Result<()> {
            if self.fail_start {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "disk gone"));
            }
            self.starts += 1;
            Ok(())
        }

        fn on_stop(&mut self) -> io::Result<()> {
            self.stops += 1;
            if self.fail_stop {
                return Err(io::Error::new(io::ErrorKind::Other, "flush failed"));
            }
            Ok(())
        }

        fn current_session_files(&self) -> Vec<SessionFile> {
            self.files.clone()
        }
    }

    fn controller<P: CapturePipeline>(
        pipeline: P,
        dir: &Path,
    ) -> RecordingController<P> {
        RecordingController::new(
            pipeline,
            dir.join("recordings"),
            BundleBuilder::new(dir.join("archives")),
        )
    }

    #[test]
    fn start_twice_opens_one_sink() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(ScriptedPipeline::default(), dir.path());

        let first = ctl.start().unwrap();
        assert!(first.is_some());
        assert_eq!(ctl.start().unwrap(), None);

        assert_eq!(ctl.state(), RecordingState::Recording);
        assert_eq!(ctl.pipeline().starts, 1);
        assert_eq!(ctl.output_path(), first.as_deref());
    }

    #[test]
    fn stop_while_idle_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(ScriptedPipeline::default(), dir.path());

        assert_eq!(ctl.stop().unwrap(), StopReport::NotRecording);
        assert_eq!(ctl.pipeline().stops, 0);
        assert!(ctl.builder().list_archives().unwrap().is_empty());
    }

    #[test]
    fn failed_sink_open_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ScriptedPipeline {
            fail_start: true,
            ..Default::default()
        };
        let mut ctl = controller(pipeline, dir.path());

        let err = ctl.start().unwrap_err();
        assert!(matches!(err, RecordingError::OpenSink { .. }));
        assert_eq!(ctl.state(), RecordingState::Idle);
        assert!(ctl.started_at().is_none());
    }

    #[test]
    fn stop_without_sessions_builds_no_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(ScriptedPipeline::default(), dir.path());

        ctl.start().unwrap();
        match ctl.stop().unwrap() {
            StopReport::Finished { bundle, .. } => assert!(bundle.is_none()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ctl.state(), RecordingState::Idle);
    }

    #[test]
    fn bundle_failure_still_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ScriptedPipeline {
            files: vec![SessionFile::new(dir.path().join("gone.avi"), 5)],
            ..Default::default()
        };
        let mut ctl = controller(pipeline, dir.path());

        ctl.start().unwrap();
        let err = ctl.stop().unwrap_err();
        assert!(matches!(err, RecordingError::Bundle(_)));
        assert_eq!(ctl.state(), RecordingState::Idle);
        assert!(ctl.output_path().is_none());
    }

    #[test]
    fn close_failure_still_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = ScriptedPipeline {
            fail_stop: true,
            ..Default::default()
        };
        let mut ctl = controller(pipeline, dir.path());

        ctl.start().unwrap();
        assert!(matches!(ctl.stop(), Err(RecordingError::CloseSink(_))));
        assert_eq!(ctl.state(), RecordingState::Idle);
        assert!(ctl.start().unwrap().is_some(), "can record again");
    }

    #[test]
    fn sessions_are_bundled_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(FileCapture::new(), dir.path());

        ctl.start().unwrap();
        ctl.pipeline_mut().write_frame(&[7u8; 12_345]).unwrap();
        let first = match ctl.stop().unwrap() {
            StopReport::Finished { bundle, .. } => bundle.unwrap(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(first.members.len(), 1);
        assert_eq!(first.members[0].size_bytes, 12_345);

        ctl.start().unwrap();
        ctl.pipeline_mut().write_frame(b"more").unwrap();
        let second = match ctl.stop().unwrap() {
            StopReport::Finished { bundle, .. } => bundle.unwrap(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(second.members.len(), 1, "first session not re-bundled");
        assert_ne!(second.members[0].path, first.members[0].path);
    }

    #[tokio::test]
    async fn empty_stop_never_reaches_broadcaster() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let (handle, _task) =
            BroadcastWorker::spawn(Broadcaster::new(ConnectionRegistry::new()), cancel.clone());
        let mut ctl = controller(ScriptedPipeline::default(), dir.path())
            .with_broadcast(handle.clone());

        ctl.start().unwrap();
        ctl.stop().unwrap();
        assert_eq!(handle.submitted(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn auto_send_controls_hand_off() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let (handle, _task) =
            BroadcastWorker::spawn(Broadcaster::new(ConnectionRegistry::new()), cancel.clone());
        let mut ctl =
            controller(FileCapture::new(), dir.path()).with_broadcast(handle.clone());

        ctl.set_auto_send(false);
        ctl.start().unwrap();
        ctl.pipeline_mut().write_frame(b"frame").unwrap();
        ctl.stop().unwrap();
        assert_eq!(handle.submitted(), 0);

        ctl.set_auto_send(true);
        ctl.start().unwrap();
        ctl.pipeline_mut().write_frame(b"frame").unwrap();
        ctl.stop().unwrap();
        assert_eq!(handle.submitted(), 1);

        let sent = ctl.send_latest().unwrap();
        assert!(sent.is_some());
        assert_eq!(handle.submitted(), 2);
        cancel.cancel();
    }
}
