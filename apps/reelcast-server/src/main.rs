//! Reelcast Server - capture node
//!
//! Records sessions from a synthetic capture source, bundles finished
//! sessions into zip archives and broadcasts each archive to every
//! connected client.
//!
//! ## Usage
//!
//! ```bash
//! reelcast-server
//!
//! # Custom port and directories
//! REELCAST_BIND=0.0.0.0:9000 REELCAST_RECORDINGS_DIR=/tmp/rec reelcast-server
//! ```
//!
//! Type `help` on stdin for the host commands.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use reelcast::capture::{start_test_source, CaptureConfig, FileCapture, TestSourceConfig, MAX_FPS};
use reelcast::recording::{BundleBuilder, RecordingController, StopReport};
use reelcast::server::{
    BroadcastWorker, Broadcaster, ConnectionRegistry, HeartbeatConfig, Server, ServerConfig,
};

/// Server configuration from environment
struct Config {
    server: ServerConfig,
    capture: CaptureConfig,
}

impl Config {
    fn from_env() -> Self {
        let bind_addr: SocketAddr = std::env::var("REELCAST_BIND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| ServerConfig::default().bind_addr);

        let interval = std::env::var("REELCAST_PING_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|ms: &u64| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(reelcast::DEFAULT_PING_INTERVAL);

        let mut heartbeat = HeartbeatConfig::with_interval(interval);
        if let Some(ms) = std::env::var("REELCAST_PONG_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            heartbeat.reply_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        let write_timeout = std::env::var("REELCAST_WRITE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|ms: &u64| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(reelcast::DEFAULT_WRITE_TIMEOUT);

        let defaults = CaptureConfig::default();
        let recordings_dir = std::env::var("REELCAST_RECORDINGS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.recordings_dir);
        let archive_dir = std::env::var("REELCAST_ARCHIVE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.archive_dir);
        let fps: u32 = std::env::var("REELCAST_FPS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(|fps: u32| fps.clamp(1, MAX_FPS))
            .unwrap_or(defaults.fps);
        let auto_send = std::env::var("REELCAST_AUTO_SEND")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.auto_send);

        Self {
            server: ServerConfig {
                bind_addr,
                heartbeat,
                write_timeout,
            },
            capture: CaptureConfig {
                recordings_dir,
                archive_dir,
                fps,
                auto_send,
                ..defaults
            },
        }
    }
}

/// Commands typed on stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostCommand {
    Start,
    Stop,
    Toggle,
    Send,
    List,
    Auto,
    QualityUp,
    QualityDown,
    Clients,
    Help,
    Quit,
}

impl HostCommand {
    fn parse(line: &str) -> Option<Self> {
        Some(match line.trim().to_ascii_lowercase().as_str() {
            "start" | "r" => Self::Start,
            "stop" => Self::Stop,
            "toggle" => Self::Toggle,
            "send" | "s" => Self::Send,
            "list" | "l" => Self::List,
            "auto" | "a" => Self::Auto,
            "+" => Self::QualityUp,
            "-" => Self::QualityDown,
            "clients" | "c" => Self::Clients,
            "help" | "h" | "?" => Self::Help,
            "quit" | "q" | "exit" => Self::Quit,
            _ => return None,
        })
    }
}

const HELP: &str = "\
commands:
  start | r     start recording
  stop          stop recording and bundle the session
  toggle        start or stop recording
  send | s      broadcast the latest archive
  list | l      list archives
  auto | a      toggle automatic broadcast after each recording
  + / -         raise / lower compression quality
  clients | c   show connected clients
  help          this text
  quit | q      shut down";

/// Longest shutdown waits for the final bundle to reach clients
const FINAL_BROADCAST_TIMEOUT: Duration = Duration::from_secs(30);

/// Input to the capture thread
enum CaptureEvent {
    Frame(Bytes),
    Command(HostCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();

    info!("Reelcast Server starting");
    info!("  Bind: {}", config.server.bind_addr);
    info!("  Recordings: {:?}", config.capture.recordings_dir);
    info!("  Archives: {:?}", config.capture.archive_dir);
    info!(
        "  Heartbeat: every {:?}, timeout {:?}",
        config.server.heartbeat.interval, config.server.heartbeat.reply_timeout
    );
    info!("  Write timeout: {:?}", config.server.write_timeout);
    info!("  Capture: {} fps, {}", config.capture.fps, config.capture.resolution);

    let registry = ConnectionRegistry::new();
    let server = Server::bind(config.server, registry.clone())
        .await
        .context("failed to start listener")?;

    // Graceful shutdown: `intake` stops frames and host commands so the
    // capture thread can finalize; `cancel` then stops the network side.
    let intake = CancellationToken::new();
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (broadcast, broadcast_task) =
        BroadcastWorker::spawn(Broadcaster::new(registry.clone()), cancel.clone());

    // Accept loop
    let accept_cancel = cancel.clone();
    let accept_tracker = tracker.clone();
    let accept = tokio::spawn(async move { server.run(accept_cancel, accept_tracker).await });

    // Capture thread: file I/O only, never touches the network
    let (events_tx, events_rx) = mpsc::channel::<CaptureEvent>(256);
    let controller = RecordingController::new(
        FileCapture::new(),
        config.capture.recordings_dir.clone(),
        BundleBuilder::new(config.capture.archive_dir.clone()),
    )
    .with_broadcast(broadcast.clone());
    let capture_config = config.capture.clone();
    let capture_thread = std::thread::Builder::new()
        .name("capture".into())
        .spawn(move || run_capture(controller, capture_config, events_rx))
        .context("failed to spawn capture thread")?;

    // Synthetic frames into the capture thread
    let mut frames = start_test_source(
        TestSourceConfig {
            fps: config.capture.fps,
            frame_size: config.capture.frame_size(),
        },
        intake.clone(),
    );
    let frame_tx = events_tx.clone();
    tracker.spawn(async move {
        while let Some(frame) = frames.recv().await {
            if frame_tx.send(CaptureEvent::Frame(frame)).await.is_err() {
                break;
            }
        }
    });

    // Host commands; stdin is read on a plain thread
    let (lines_tx, mut lines) = mpsc::channel::<String>(16);
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || read_stdin(lines_tx))
        .context("failed to spawn stdin thread")?;

    let stdin_cancel = intake.clone();
    let stdin_registry = registry.clone();
    tracker.spawn(async move {
        loop {
            let line = tokio::select! {
                _ = stdin_cancel.cancelled() => break,
                line = lines.recv() => line,
            };
            let Some(line) = line else {
                info!("stdin closed; host commands disabled");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match HostCommand::parse(&line) {
                Some(HostCommand::Quit) => {
                    stdin_cancel.cancel();
                    break;
                }
                Some(HostCommand::Help) => println!("{HELP}"),
                Some(HostCommand::Clients) => {
                    let stats = stdin_registry.stats().await;
                    info!(
                        "Clients: {} connected ({} total, {} removed)",
                        stats.connected, stats.total_added, stats.total_removed
                    );
                    for conn in stdin_registry.snapshot().await {
                        info!("  {} {}", conn.id(), conn.remote_addr());
                    }
                }
                Some(cmd) => {
                    if events_tx.send(CaptureEvent::Command(cmd)).await.is_err() {
                        break;
                    }
                }
                None => warn!("Unknown command {:?}; type `help`", line.trim()),
            }
        }
    });

    tracker.close();

    info!("Waiting for connections...");
    let mut accept = accept;
    let mut accept_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = intake.cancelled() => {
            info!("Shutdown requested");
        }
        result = &mut accept => {
            accept_done = true;
            match result {
                Ok(Err(e)) => error!("Listener failed: {}", e),
                Err(e) => error!("Accept task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }
    intake.cancel();

    // The frame forwarder and host command task hold the only event senders;
    // once they exit the capture thread finalizes any open session, hands
    // the bundle to the broadcaster and returns.
    match tokio::task::spawn_blocking(move || capture_thread.join()).await {
        Ok(Ok(())) => {}
        _ => warn!("Capture thread ended abnormally"),
    }
    info!("Delivering pending broadcast before shutdown");
    if tokio::time::timeout(FINAL_BROADCAST_TIMEOUT, broadcast.settled())
        .await
        .is_err()
    {
        warn!("Final broadcast still running after {:?}", FINAL_BROADCAST_TIMEOUT);
    }
    cancel.cancel();

    if !accept_done {
        if let Ok(Err(e)) = accept.await {
            error!("Listener failed: {}", e);
        }
    }
    if let Err(e) = broadcast_task.await {
        warn!("Broadcast worker ended abnormally: {}", e);
    }
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .is_err()
    {
        warn!("Shutdown timed out after 5s");
    }

    info!("Reelcast Server stopped");
    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "reelcast=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn read_stdin(lines: mpsc::Sender<String>) {
    for line in std::io::stdin().lines() {
        match line {
            Ok(line) => {
                if lines.blocking_send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        }
    }
}

/// Owns the recording controller for the lifetime of the process.
fn run_capture(
    mut controller: RecordingController<FileCapture>,
    mut config: CaptureConfig,
    mut events: mpsc::Receiver<CaptureEvent>,
) {
    controller.set_auto_send(config.auto_send);

    while let Some(event) = events.blocking_recv() {
        match event {
            CaptureEvent::Frame(frame) => {
                if let Err(e) = controller.pipeline_mut().write_frame(&frame) {
                    warn!(error = %e, "Failed to write frame");
                }
            }
            CaptureEvent::Command(cmd) => handle_command(&mut controller, &mut config, cmd),
        }
    }

    if controller.is_recording() {
        info!("Finalizing open session before exit");
        report_stop(controller.stop());
    }
}

fn handle_command(
    controller: &mut RecordingController<FileCapture>,
    config: &mut CaptureConfig,
    cmd: HostCommand,
) {
    match cmd {
        HostCommand::Start => start(controller),
        HostCommand::Stop => report_stop(controller.stop()),
        HostCommand::Toggle if controller.is_recording() => report_stop(controller.stop()),
        HostCommand::Toggle => start(controller),
        HostCommand::Send => match controller.send_latest() {
            Ok(Some(bundle)) => info!("Queued {} for broadcast", bundle.file_name()),
            Ok(None) => {}
            Err(e) => error!("Cannot send latest archive: {}", e),
        },
        HostCommand::List => match controller.builder().list_archives() {
            Ok(archives) if archives.is_empty() => info!("No archives"),
            Ok(archives) => {
                info!("{} archive(s):", archives.len());
                for a in archives {
                    info!("  {:?} ({:.2} MB)", a.path, a.size_bytes as f64 / (1024.0 * 1024.0));
                }
            }
            Err(e) => error!("Cannot list archives: {}", e),
        },
        HostCommand::Auto => {
            let enabled = !controller.auto_send();
            controller.set_auto_send(enabled);
            config.auto_send = enabled;
        }
        HostCommand::QualityUp => {
            config.raise_quality();
        }
        HostCommand::QualityDown => {
            config.lower_quality();
        }
        HostCommand::Clients | HostCommand::Help | HostCommand::Quit => {}
    }
}

fn start(controller: &mut RecordingController<FileCapture>) {
    match controller.start() {
        Ok(Some(path)) => info!("Recording to {:?}", path),
        Ok(None) => info!("Already recording"),
        Err(e) => error!("Cannot start recording: {}", e),
    }
}

fn report_stop(result: Result<StopReport, reelcast::RecordingError>) {
    match result {
        Ok(StopReport::NotRecording) => info!("Not recording"),
        Ok(StopReport::Finished { duration, bundle }) => {
            info!("Recorded {:.1}s", duration.as_secs_f64());
            match bundle {
                Some(bundle) => info!(
                    "Bundle {} ({} session(s), {} bytes)",
                    bundle.file_name(),
                    bundle.members.len(),
                    bundle.size_bytes
                ),
                None => info!("Nothing new to bundle"),
            }
        }
        Err(e) => error!("Recording did not finish cleanly: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_commands_parse() {
        assert_eq!(HostCommand::parse(" Start "), Some(HostCommand::Start));
        assert_eq!(HostCommand::parse("+"), Some(HostCommand::QualityUp));
        assert_eq!(HostCommand::parse("q"), Some(HostCommand::Quit));
        assert_eq!(HostCommand::parse("record everything"), None);
    }
}
