//! Capture side of the node
//!
//! - `FileCapture`: a [`CapturePipeline`](crate::recording::CapturePipeline)
//!   that writes frames straight into the session file
//! - `start_test_source`: synthetic frames at a fixed rate
//! - `CaptureConfig`: directories, frame rate and encoder knobs

mod file;
mod source;

pub use file::FileCapture;
pub use source::{start_test_source, TestSourceConfig, MAX_FPS};

use std::path::PathBuf;

use tracing::info;

/// Lowest accepted compression quality
pub const MIN_QUALITY: u8 = 5;
/// Highest accepted compression quality
pub const MAX_QUALITY: u8 = 100;
/// Step used by [`CaptureConfig::raise_quality`] and [`CaptureConfig::lower_quality`]
pub const QUALITY_STEP: u8 = 5;

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Where session files are written
    pub recordings_dir: PathBuf,
    /// Where bundles are written
    pub archive_dir: PathBuf,
    pub fps: u32,
    pub resolution: Resolution,
    /// Encoder quality, `5..=100`
    pub compression_quality: u8,
    /// Hand each new bundle to the broadcaster
    pub auto_send: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("recordings"),
            archive_dir: PathBuf::from("."),
            fps: 30,
            resolution: Resolution::default(),
            compression_quality: 50,
            auto_send: true,
        }
    }
}

impl CaptureConfig {
    /// Set quality, clamped to the accepted range.
    pub fn set_quality(&mut self, quality: u8) -> u8 {
        self.compression_quality = quality.clamp(MIN_QUALITY, MAX_QUALITY);
        info!(quality = self.compression_quality, "Compression quality");
        self.compression_quality
    }

    pub fn raise_quality(&mut self) -> u8 {
        self.set_quality(self.compression_quality.saturating_add(QUALITY_STEP))
    }

    pub fn lower_quality(&mut self) -> u8 {
        self.set_quality(self.compression_quality.saturating_sub(QUALITY_STEP))
    }

    /// Size of one synthetic frame for the configured resolution and quality.
    pub fn frame_size(&self) -> usize {
        let raw = self.resolution.width as usize * self.resolution.height as usize * 3;
        // 100 gives 1/100 of raw, 5 gives 1/2000
        (raw * self.compression_quality as usize / 10_000).max(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_moves_in_steps_and_clamps() {
        let mut config = CaptureConfig::default();
        assert_eq!(config.compression_quality, 50);
        assert_eq!(config.raise_quality(), 55);
        config.set_quality(95);
        assert_eq!(config.raise_quality(), 100);
        assert_eq!(config.raise_quality(), 100);

        config.set_quality(10);
        assert_eq!(config.lower_quality(), 5);
        assert_eq!(config.lower_quality(), 5);

        assert_eq!(config.set_quality(0), MIN_QUALITY);
    }

    #[test]
    fn frame_size_tracks_quality() {
        let mut config = CaptureConfig::default();
        let high = config.frame_size();
        config.set_quality(MIN_QUALITY);
        let low = config.frame_size();
        assert!(low < high);
        assert!(low >= 64);
    }

    #[test]
    fn defaults_are_vga_at_half_quality() {
        let config = CaptureConfig::default();
        assert_eq!(config.resolution, Resolution { width: 640, height: 480 });
        assert_eq!(config.fps, 30);
        assert_eq!(config.frame_size(), 640 * 480 * 3 * 50 / 10_000);
    }
}
