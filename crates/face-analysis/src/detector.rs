//! Collaborator traits for face detection, embedding and pose

use std::sync::Arc;

use camera_capture::frame::VideoFrame;
use face_auth::Embedding;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::gaze::PoseEstimate;
use crate::mock::MockBackend;
use crate::scripted::ScriptedBackend;
use crate::{AnalysisConfig, AnalysisError, BackendKind};

/// Face bounding box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Integer crop rectangle clamped to the frame, `None` if nothing remains
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Embedding plus the face it was taken from
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub embedding: Embedding,
    pub bbox: Option<BoundingBox>,
}

/// Finds faces in a frame
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &VideoFrame) -> Result<Vec<BoundingBox>, AnalysisError>;
}

/// Produces a face embedding, `Ok(None)` when no usable face is found
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, frame: &VideoFrame) -> Result<Option<Extraction>, AnalysisError>;

    /// Embedding of one detected face, taken from the frame cropped to `face`
    fn extract_face(
        &self,
        frame: &VideoFrame,
        face: &BoundingBox,
    ) -> Result<Option<Extraction>, AnalysisError> {
        let Some((x, y, w, h)) = face.clamp_to(frame.width, frame.height) else {
            return Ok(None);
        };
        let Some(crop) = frame.crop(x, y, w, h) else {
            return Ok(None);
        };
        Ok(self.extract(&crop)?.map(|extraction| Extraction {
            embedding: extraction.embedding,
            bbox: Some(*face),
        }))
    }
}

/// Estimates head pose, `Ok(None)` when landmarks are not found
pub trait PoseEstimator: Send + Sync {
    fn estimate(&self, frame: &VideoFrame) -> Result<Option<PoseEstimate>, AnalysisError>;
}

/// The three collaborators used to analyze a frame
#[derive(Clone)]
pub struct Backends {
    pub detector: Arc<dyn FaceDetector>,
    pub extractor: Arc<dyn EmbeddingExtractor>,
    pub pose: Arc<dyn PoseEstimator>,
}

impl Backends {
    /// Use one implementation for all three roles
    pub fn uniform<B>(backend: Arc<B>) -> Self
    where
        B: FaceDetector + EmbeddingExtractor + PoseEstimator + 'static,
    {
        Self {
            detector: backend.clone(),
            extractor: backend.clone(),
            pose: backend,
        }
    }

    /// Select backends at startup
    pub fn from_config(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        match &config.backend {
            BackendKind::Mock => {
                warn!("No model backend configured. Using mock implementation.");
                Ok(Self::uniform(Arc::new(MockBackend::new(
                    config.mock_dark_luminance,
                    config.mock_histogram_bins,
                ))))
            }
            BackendKind::Script { path } => {
                info!("Loading scripted backend from {}", path.display());
                Ok(Self::uniform(Arc::new(ScriptedBackend::from_json_file(path)?)))
            }
        }
    }
}
