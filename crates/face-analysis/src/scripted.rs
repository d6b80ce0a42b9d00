//! Scripted backend that replays per-frame signals keyed by frame sequence

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use camera_capture::frame::VideoFrame;
use face_auth::Embedding;
use serde::{Deserialize, Serialize};

use crate::detector::{BoundingBox, EmbeddingExtractor, Extraction, FaceDetector, PoseEstimator};
use crate::gaze::PoseEstimate;
use crate::AnalysisError;

/// What the backend reports for one frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedFrame {
    /// Number of faces the detector reports
    pub faces: usize,
    /// Embedding for the single face, absent when extraction fails
    pub embedding: Option<Vec<f32>>,
    pub pose: Option<PoseEstimate>,
    /// Make the detector itself fail
    pub detector_error: bool,
    /// Embeddings of individual faces, left to right, for per-face
    /// extraction. Faces past the end fall back to `embedding`.
    pub face_embeddings: Vec<Vec<f32>>,
}

impl ScriptedFrame {
    pub fn no_face() -> Self {
        Self::default()
    }

    pub fn faces(count: usize) -> Self {
        Self {
            faces: count,
            ..Default::default()
        }
    }

    /// One face with the given embedding
    pub fn face(embedding: Vec<f32>) -> Self {
        Self {
            faces: 1,
            embedding: Some(embedding),
            ..Default::default()
        }
    }

    pub fn detector_failure() -> Self {
        Self {
            detector_error: true,
            ..Default::default()
        }
    }

    pub fn with_pose(mut self, yaw: f32, pitch: f32) -> Self {
        self.pose = Some(PoseEstimate::new(yaw, pitch));
        self
    }

    /// One face per embedding, side by side
    pub fn crowd(embeddings: Vec<Vec<f32>>) -> Self {
        Self {
            faces: embeddings.len(),
            face_embeddings: embeddings,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Script {
    default: ScriptedFrame,
    frames: HashMap<u64, ScriptedFrame>,
    delay_ms: Option<u64>,
}

/// Backend whose answers are fixed in advance per frame sequence number
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    frames: HashMap<u64, ScriptedFrame>,
    fallback: ScriptedFrame,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    /// Frames without an entry get `fallback`
    pub fn new(fallback: ScriptedFrame) -> Self {
        Self {
            fallback,
            ..Default::default()
        }
    }

    pub fn with_frame(mut self, sequence: u64, frame: ScriptedFrame) -> Self {
        self.frames.insert(sequence, frame);
        self
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Load a script of the form
    /// `{"default": {...}, "frames": {"3": {...}}, "delay_ms": 10}`
    pub fn from_json(json: &str) -> Result<Self, AnalysisError> {
        let script: Script =
            serde_json::from_str(json).map_err(|e| AnalysisError::Script(e.to_string()))?;
        Ok(Self {
            frames: script.frames,
            fallback: script.default,
            delay: script.delay_ms.map(Duration::from_millis),
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self, AnalysisError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| AnalysisError::Script(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    fn lookup(&self, frame: &VideoFrame) -> &ScriptedFrame {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.frames.get(&frame.sequence).unwrap_or(&self.fallback)
    }

    fn boxes(frame: &VideoFrame, count: usize) -> Vec<BoundingBox> {
        let slot = frame.width as f32 / count.max(1) as f32;
        (0..count)
            .map(|i| BoundingBox {
                x: slot * i as f32,
                y: 0.0,
                width: slot,
                height: frame.height as f32,
                confidence: 0.9,
            })
            .collect()
    }
}

impl FaceDetector for ScriptedBackend {
    fn detect(&self, frame: &VideoFrame) -> Result<Vec<BoundingBox>, AnalysisError> {
        let script = self.lookup(frame);
        if script.detector_error {
            return Err(AnalysisError::Backend(format!(
                "scripted detector failure at frame {}",
                frame.sequence
            )));
        }
        Ok(Self::boxes(frame, script.faces))
    }
}

impl EmbeddingExtractor for ScriptedBackend {
    fn extract(&self, frame: &VideoFrame) -> Result<Option<Extraction>, AnalysisError> {
        let script = self.lookup(frame);
        Ok(script.embedding.as_ref().map(|values| Extraction {
            embedding: Embedding::new(values.clone()),
            bbox: Self::boxes(frame, 1).into_iter().next(),
        }))
    }

    fn extract_face(
        &self,
        frame: &VideoFrame,
        face: &BoundingBox,
    ) -> Result<Option<Extraction>, AnalysisError> {
        let script = self.lookup(frame);
        let slot = frame.width as f32 / script.faces.max(1) as f32;
        let index = (face.x / slot).round() as usize;
        let values = script
            .face_embeddings
            .get(index)
            .or(script.embedding.as_ref());
        Ok(values.map(|values| Extraction {
            embedding: Embedding::new(values.clone()),
            bbox: Some(*face),
        }))
    }
}

impl PoseEstimator for ScriptedBackend {
    fn estimate(&self, frame: &VideoFrame) -> Result<Option<PoseEstimate>, AnalysisError> {
        Ok(self.lookup(frame).pose)
    }
}
