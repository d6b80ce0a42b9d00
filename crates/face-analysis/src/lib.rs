//! Face Analysis
//!
//! Per-frame signal extraction for proctoring:
//! - Face detection, embedding extraction and head-pose estimation behind
//!   swappable backend traits
//! - Deadline-bounded analysis of a frame into raw signals
//! - Gaze deviation classification

pub mod analyzer;
pub mod config;
pub mod detector;
pub mod gaze;
pub mod mock;
pub mod scripted;

pub use analyzer::{FaceAnalyzer, FaceSample, FrameSignals};
pub use config::{AnalysisConfig, BackendKind};
pub use detector::{Backends, BoundingBox, EmbeddingExtractor, Extraction, FaceDetector, PoseEstimator};
pub use gaze::{is_deviated, GazeConfig, PoseEstimate};
pub use mock::MockBackend;
pub use scripted::{ScriptedBackend, ScriptedFrame};

use std::time::Duration;
use thiserror::Error;

/// Analysis error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("Backend failed: {0}")]
    Backend(String),

    #[error("Backend exceeded deadline of {0:?}")]
    Timeout(Duration),

    #[error("Backend script error: {0}")]
    Script(String),
}
