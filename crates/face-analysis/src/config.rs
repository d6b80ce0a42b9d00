//! Analysis backend configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which collaborator implementation to run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    /// Deterministic luminance-based stand-in
    #[default]
    Mock,
    /// Per-frame signals replayed from a JSON script
    Script { path: PathBuf },
}

/// Analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub backend: BackendKind,

    /// Mean luminance below which the mock backend sees no face
    pub mock_dark_luminance: f32,

    /// Histogram bins used by the mock embedding
    pub mock_histogram_bins: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Mock,
            mock_dark_luminance: 20.0,
            mock_histogram_bins: 32,
        }
    }
}
