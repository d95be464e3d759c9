//! Synthetic frame source

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Highest frame rate the source will run at
pub const MAX_FPS: u32 = 1000;

/// Configuration for the synthetic source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestSourceConfig {
    pub fps: u32,
    /// Size of every frame in bytes
    pub frame_size: usize,
}

impl Default for TestSourceConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            frame_size: 10_000,
        }
    }
}

/// Generate frames at `config.fps` (clamped to `1..=MAX_FPS`) until `cancel`
/// fires or the receiver is dropped.
///
/// Each frame starts with its sequence number (u32 BE) and the capture
/// timestamp in microseconds (u64 BE); the rest is a fill pattern.
pub fn start_test_source(config: TestSourceConfig, cancel: CancellationToken) -> mpsc::Receiver<Bytes> {
    let fps = config.fps.clamp(1, MAX_FPS);
    let (tx, rx) = mpsc::channel(fps as usize);

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_micros(1_000_000 / fps as u64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let start = Instant::now();
        let mut frame_num = 0u32;

        info!(fps, frame_size = config.frame_size, "Test source started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let timestamp_us = start.elapsed().as_micros() as u64;
            let mut frame = BytesMut::with_capacity(config.frame_size.max(12));
            frame.put_u32(frame_num);
            frame.put_u64(timestamp_us);
            frame.resize(config.frame_size.max(12), (frame_num & 0xFF) as u8);
            frame.truncate(config.frame_size);

            if tx.send(frame.freeze()).await.is_err() {
                debug!("Test source receiver dropped");
                break;
            }

            frame_num = frame_num.wrapping_add(1);
        }

        info!(frames = frame_num, "Test source stopped");
    });

    rx
}
