//! Deadline-bounded frame analysis

use std::sync::Arc;
use std::time::Duration;

use camera_capture::frame::VideoFrame;
use face_auth::Embedding;
use serde::Serialize;
use tracing::{debug, warn};

use crate::detector::{Backends, BoundingBox, Extraction};
use crate::gaze::PoseEstimate;
use crate::AnalysisError;

/// Raw signals for one frame
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameSignals {
    pub faces: Vec<BoundingBox>,
    /// Present only when exactly one face was found and extraction succeeded
    #[serde(skip)]
    pub embedding: Option<Embedding>,
    /// Present only when exactly one face was found and pose was determinable
    pub pose: Option<PoseEstimate>,
}

impl FrameSignals {
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }
}

/// One detected face and its embedding, when obtainable
#[derive(Debug, Clone, PartialEq)]
pub struct FaceSample {
    pub bbox: BoundingBox,
    pub embedding: Option<Embedding>,
}

/// Runs the collaborators on a frame, each under the same per-call deadline.
///
/// Backends are blocking and run on the blocking pool. A detector failure
/// or timeout is an error. Embedding and pose failures or timeouts are
/// logged and reported as absent signals.
#[derive(Clone)]
pub struct FaceAnalyzer {
    backends: Backends,
    deadline: Duration,
}

impl FaceAnalyzer {
    pub fn new(backends: Backends, deadline: Duration) -> Self {
        Self { backends, deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Detect faces, then extract embedding and pose when exactly one is present
    pub async fn analyze(&self, frame: Arc<VideoFrame>) -> Result<FrameSignals, AnalysisError> {
        let faces = self.detect(frame.clone()).await?;
        if faces.len() != 1 {
            debug!(sequence = frame.sequence, faces = faces.len(), "frame analyzed");
            return Ok(FrameSignals {
                faces,
                ..Default::default()
            });
        }

        let (extraction, pose) = tokio::join!(
            self.extract_optional(frame.clone()),
            self.estimate_optional(frame.clone())
        );

        debug!(
            sequence = frame.sequence,
            embedding = extraction.is_some(),
            pose = pose.is_some(),
            "frame analyzed"
        );

        Ok(FrameSignals {
            faces,
            embedding: extraction.map(|e| e.embedding),
            pose,
        })
    }

    /// Detect faces and extract an embedding from each face's crop.
    ///
    /// Every extraction gets its own deadline; a failed or late one leaves
    /// that face without an embedding.
    pub async fn analyze_faces(&self, frame: Arc<VideoFrame>) -> Result<Vec<FaceSample>, AnalysisError> {
        let faces = self.detect(frame.clone()).await?;
        let mut samples = Vec::with_capacity(faces.len());
        for bbox in faces {
            let extractor = self.backends.extractor.clone();
            let source = frame.clone();
            let embedding = match self.run(move || extractor.extract_face(&source, &bbox)).await {
                Ok(extraction) => extraction.map(|e| e.embedding),
                Err(e) => {
                    warn!(sequence = frame.sequence, error = %e, "face embedding unobtainable");
                    None
                }
            };
            samples.push(FaceSample { bbox, embedding });
        }

        debug!(sequence = frame.sequence, faces = samples.len(), "faces analyzed");
        Ok(samples)
    }

    /// Face detection only
    pub async fn detect(&self, frame: Arc<VideoFrame>) -> Result<Vec<BoundingBox>, AnalysisError> {
        let detector = self.backends.detector.clone();
        self.run(move || detector.detect(&frame)).await
    }

    /// Embedding extraction with failures surfaced, used for enrollment
    pub async fn extract(&self, frame: Arc<VideoFrame>) -> Result<Option<Extraction>, AnalysisError> {
        let extractor = self.backends.extractor.clone();
        self.run(move || extractor.extract(&frame)).await
    }

    async fn extract_optional(&self, frame: Arc<VideoFrame>) -> Option<Extraction> {
        let sequence = frame.sequence;
        match self.extract(frame).await {
            Ok(extraction) => extraction,
            Err(e) => {
                warn!(sequence, error = %e, "embedding unobtainable");
                None
            }
        }
    }

    async fn estimate_optional(&self, frame: Arc<VideoFrame>) -> Option<PoseEstimate> {
        let sequence = frame.sequence;
        let estimator = self.backends.pose.clone();
        match self.run(move || estimator.estimate(&frame)).await {
            Ok(pose) => pose,
            Err(e) => {
                warn!(sequence, error = %e, "pose unobtainable");
                None
            }
        }
    }

    async fn run<T, F>(&self, call: F) -> Result<T, AnalysisError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, AnalysisError> + Send + 'static,
    {
        match tokio::time::timeout(self.deadline, tokio::task::spawn_blocking(call)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(AnalysisError::Backend(format!("backend task failed: {join}"))),
            Err(_) => Err(AnalysisError::Timeout(self.deadline)),
        }
    }
}
