//! Camera Capture Library for Exam Proctoring
//!
//! Provides the frame type shared by every stage of the proctoring engine
//! and the capture sources that feed the continuous monitor:
//! - Decoded RGB frames (from uploaded images or a capture device)
//! - A `CaptureSource` trait for anything that yields frames at its own rate
//! - A directory replay source for offline review of recorded sessions

pub mod frame;
pub mod source;

pub use frame::{decode_image, VideoFrame};
pub use source::{CaptureSource, DirectorySource, ReplaySource};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Camera error types
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open capture source: {0}")]
    Open(String),

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Streaming error: {0}")]
    Stream(String),

    #[error("Capture source disconnected")]
    Disconnected,
}

/// Capture source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Directory of recorded frames (replayed in file-name order)
    pub directory: PathBuf,
    /// Target FPS
    pub fps: u32,
    /// Restart from the first frame after the last one
    pub loop_playback: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("frames"),
            fps: 15,
            loop_playback: false,
        }
    }
}

impl CameraConfig {
    /// Interval between frames at the configured rate
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_micros(1_000_000 / u64::from(self.fps.max(1)))
    }
}
