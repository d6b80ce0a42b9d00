//! Gaze deviation classification

use serde::{Deserialize, Serialize};

/// Head pose in degrees. Zero is facing the camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseEstimate {
    /// Left-right rotation
    pub yaw: f32,
    /// Up-down tilt
    pub pitch: f32,
}

impl PoseEstimate {
    pub fn new(yaw: f32, pitch: f32) -> Self {
        Self { yaw, pitch }
    }
}

/// Deviated iff `|yaw| > yaw_max` or `|pitch| > pitch_max`
#[inline]
pub fn is_deviated(pose: &PoseEstimate, yaw_max: f32, pitch_max: f32) -> bool {
    pose.yaw.abs() > yaw_max || pose.pitch.abs() > pitch_max
}

/// Gaze bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GazeConfig {
    /// Maximum tolerated yaw (degrees from center)
    pub yaw_max_degrees: f32,

    /// Maximum tolerated pitch (degrees from center)
    pub pitch_max_degrees: f32,
}

impl Default for GazeConfig {
    fn default() -> Self {
        Self {
            yaw_max_degrees: 30.0,
            pitch_max_degrees: 25.0,
        }
    }
}

impl GazeConfig {
    /// Create strict config (tighter bounds)
    pub fn strict() -> Self {
        Self {
            yaw_max_degrees: 20.0,
            pitch_max_degrees: 15.0,
        }
    }

    /// Create lenient config (looser bounds)
    pub fn lenient() -> Self {
        Self {
            yaw_max_degrees: 45.0,
            pitch_max_degrees: 35.0,
        }
    }

    pub fn is_deviated(&self, pose: &PoseEstimate) -> bool {
        is_deviated(pose, self.yaw_max_degrees, self.pitch_max_degrees)
    }
}
