//! Deterministic mock backend

use camera_capture::frame::VideoFrame;
use face_auth::Embedding;

use crate::detector::{BoundingBox, EmbeddingExtractor, Extraction, FaceDetector, PoseEstimator};
use crate::gaze::PoseEstimate;
use crate::AnalysisError;

/// Stand-in backend used when no model is available.
///
/// A dark frame has no face; any other frame has one centred face. The
/// embedding is a luminance histogram of that face, so identical images
/// match perfectly and differently lit ones drift apart. Pose is never
/// determinable.
#[derive(Debug, Clone)]
pub struct MockBackend {
    dark_luminance: f32,
    bins: usize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(20.0, 32)
    }
}

impl MockBackend {
    pub fn new(dark_luminance: f32, bins: usize) -> Self {
        Self {
            dark_luminance,
            bins: bins.max(1),
        }
    }

    fn centred_face(&self, frame: &VideoFrame) -> Option<BoundingBox> {
        if frame.mean_luminance() < self.dark_luminance {
            return None;
        }
        Some(BoundingBox {
            x: frame.width as f32 * 0.3,
            y: frame.height as f32 * 0.2,
            width: frame.width as f32 * 0.4,
            height: frame.height as f32 * 0.5,
            confidence: 0.95,
        })
    }

    fn histogram(&self, frame: &VideoFrame) -> Vec<f32> {
        let mut bins = vec![0.0f32; self.bins];
        for value in frame.to_grayscale() {
            let idx = (value as usize * self.bins) / 256;
            bins[idx] += 1.0;
        }
        bins
    }
}

impl FaceDetector for MockBackend {
    fn detect(&self, frame: &VideoFrame) -> Result<Vec<BoundingBox>, AnalysisError> {
        Ok(self.centred_face(frame).into_iter().collect())
    }
}

impl EmbeddingExtractor for MockBackend {
    fn extract(&self, frame: &VideoFrame) -> Result<Option<Extraction>, AnalysisError> {
        let Some(bbox) = self.centred_face(frame) else {
            return Ok(None);
        };
        let Some((x, y, w, h)) = bbox.clamp_to(frame.width, frame.height) else {
            return Ok(None);
        };
        let Some(face) = frame.crop(x, y, w, h) else {
            return Ok(None);
        };

        Ok(Some(Extraction {
            embedding: Embedding::new(self.histogram(&face)),
            bbox: Some(bbox),
        }))
    }
}

impl PoseEstimator for MockBackend {
    fn estimate(&self, _frame: &VideoFrame) -> Result<Option<PoseEstimate>, AnalysisError> {
        Ok(None)
    }
}
