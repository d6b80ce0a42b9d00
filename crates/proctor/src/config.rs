//! Proctoring policy configuration

use face_analysis::GazeConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Proctoring policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProctorConfig {
    /// Minimum cosine similarity to accept an identity match
    pub acceptance_threshold: f32,

    /// Consecutive no-face frames tolerated before locking
    pub no_face_grace_frames: u32,

    /// Trailing window for counting look-away incidents (seconds)
    pub look_away_window_secs: u64,

    /// Look-away incidents within the window that lock the session
    pub look_away_min_hits: usize,

    /// Per-call deadline for detection, embedding and pose (milliseconds)
    pub collaborator_deadline_ms: u64,

    pub gaze: GazeConfig,
}

impl Default for ProctorConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.5,
            no_face_grace_frames: 10,
            look_away_window_secs: 10,
            look_away_min_hits: 3,
            collaborator_deadline_ms: 500,
            gaze: GazeConfig::default(),
        }
    }
}

impl ProctorConfig {
    /// Create strict config (less tolerance for noise)
    pub fn strict() -> Self {
        Self {
            acceptance_threshold: 0.6,
            no_face_grace_frames: 5,
            look_away_window_secs: 15,
            look_away_min_hits: 2,
            gaze: GazeConfig::strict(),
            ..Default::default()
        }
    }

    /// Create lenient config (more tolerance for noise)
    pub fn lenient() -> Self {
        Self {
            acceptance_threshold: 0.45,
            no_face_grace_frames: 20,
            look_away_window_secs: 10,
            look_away_min_hits: 5,
            gaze: GazeConfig::lenient(),
            ..Default::default()
        }
    }

    pub fn look_away_window(&self) -> Duration {
        Duration::from_secs(self.look_away_window_secs)
    }

    pub fn collaborator_deadline(&self) -> Duration {
        Duration::from_millis(self.collaborator_deadline_ms)
    }
}
