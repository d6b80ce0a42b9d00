//! Continuous Stream Monitor
//!
//! One capture producer thread per stream feeds a drop-oldest buffer; a
//! single async consumer analyzes the freshest frame, tracks the face-count
//! trend and, in exam mode, drives the proctoring state machine for one
//! session.

pub mod pipeline;
pub mod stats;
pub mod trend;

pub use pipeline::{MonitorMode, StreamHandle, StreamMonitor};
pub use stats::{StatsRegistry, StatsSnapshot, StreamState, StreamStats};
pub use trend::{FaceCountTrend, TrendSnapshot};

pub use ring_buffer::ConsumeOrder;

use ring_buffer::BufferError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Stream already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Failed to spawn producer: {0}")]
    Spawn(String),
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Frames held between producer and consumer
    pub buffer_capacity: usize,
    /// Admitted frames covered by the face-count trend
    pub trend_window: usize,
    /// Processed frames between FPS samples
    pub fps_sample_frames: u64,
    pub consume_order: ConsumeOrder,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: ring_buffer::DEFAULT_CAPACITY,
            trend_window: 30,
            fps_sample_frames: 30,
            consume_order: ConsumeOrder::Latest,
        }
    }
}
