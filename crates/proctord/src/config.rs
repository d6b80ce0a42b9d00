//! Daemon configuration
//!
//! Loaded from an optional TOML file, then overridden by `PROCTOR__`
//! environment variables (`PROCTOR__PROCTOR__NO_FACE_GRACE_FRAMES=5`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use camera_capture::CameraConfig;
use face_analysis::AnalysisConfig;
use proctor::ProctorConfig;
use serde::{Deserialize, Serialize};
use stream_monitor::StreamConfig;

pub const DEFAULT_CONFIG_PATH: &str = "proctord.toml";
const ENV_PREFIX: &str = "PROCTOR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level: trace, debug, info, warn or error
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Prometheus scrape endpoint
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Sqlite { url: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Count faces on the camera feed only
    #[default]
    Detection,
    /// Verify the candidate, open a session and proctor it
    Exam,
    /// Label every face on the feed with its best gallery match
    Recognition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub mode: RunMode,
    /// Images named `<identity>.<ext>` enrolled at startup
    pub enrollment_dir: Option<PathBuf>,
    pub exam_code: String,
    /// Candidate identity (exam mode)
    pub identity: Option<String>,
    /// Reference photo checked before the session starts (exam mode)
    pub reference_image: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Detection,
            enrollment_dir: None,
            exam_code: "EXAM-1".to_string(),
            identity: None,
            reference_image: None,
        }
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub storage: StorageConfig,
    pub analysis: AnalysisConfig,
    pub proctor: ProctorConfig,
    pub stream: StreamConfig,
    pub camera: CameraConfig,
    pub run: RunConfig,
}

impl AppConfig {
    /// Load `path` (if it exists) layered under the environment
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
