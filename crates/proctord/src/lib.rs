//! Exam Proctoring Daemon
//!
//! Wires the proctoring engine together: logging, metrics export, storage,
//! analysis backends, startup enrollment and one monitored capture stream.

pub mod config;

pub use config::{AppConfig, LoggingConfig, MetricsConfig, RunConfig, RunMode, StorageConfig};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use camera_capture::DirectorySource;
use face_analysis::{Backends, FaceAnalyzer};
use face_auth::IdentityId;
use metrics_exporter_prometheus::PrometheusBuilder;
use proctor::{ErrorCategory, ProctorError, ProctorService, SessionStart};
use storage::{InMemoryStore, ProctorStore, SqliteStore, SystemClock};
use stream_monitor::{MonitorMode, StatsRegistry, StreamMonitor};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Initialize logging
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level: Level = config
        .level
        .parse()
        .with_context(|| format!("invalid log level {:?}", config.level))?;

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);
    if config.json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

/// Install the Prometheus exporter when enabled
pub fn install_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }
    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .context("failed to install Prometheus exporter")?;
    info!(listen = %config.listen, "metrics exporter listening");
    Ok(())
}

pub async fn open_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn ProctorStore>> {
    Ok(match config {
        StorageConfig::Memory => {
            warn!("Using in-memory storage; nothing survives a restart");
            Arc::new(InMemoryStore::new())
        }
        StorageConfig::Sqlite { url } => {
            info!(url = %url, "opening SQLite storage");
            Arc::new(SqliteStore::connect(url).await?)
        }
    })
}

/// Build the proctoring service from configuration
pub async fn build_service(config: &AppConfig) -> anyhow::Result<Arc<ProctorService>> {
    let store = open_store(&config.storage).await?;
    let backends = Backends::from_config(&config.analysis)?;
    let analyzer = FaceAnalyzer::new(backends, config.proctor.collaborator_deadline());
    let service =
        ProctorService::new(config.proctor.clone(), store, Arc::new(SystemClock), analyzer).await?;
    Ok(Arc::new(service))
}

/// Outcome of enrolling a directory of reference photos
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnrollmentReport {
    pub enrolled: usize,
    /// Already enrolled
    pub skipped: usize,
    /// Rejected photos (no face, undecodable)
    pub rejected: Vec<PathBuf>,
}

/// Enroll every `<identity>.<ext>` image in `directory`.
///
/// Bad photos are reported and skipped; storage failures abort.
pub async fn enroll_directory(
    service: &ProctorService,
    directory: &Path,
) -> anyhow::Result<EnrollmentReport> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(directory)
        .with_context(|| format!("cannot read enrollment directory {}", directory.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    let mut report = EnrollmentReport::default();
    for path in files {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let image = tokio::fs::read(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;

        match service
            .enroll_identity(IdentityId::from(stem), stem, &image)
            .await
        {
            Ok(_) => report.enrolled += 1,
            Err(ProctorError::DuplicateIdentity(_)) => report.skipped += 1,
            Err(e) if e.category() == ErrorCategory::Storage => return Err(e.into()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "enrollment photo rejected");
                report.rejected.push(path);
            }
        }
    }

    info!(
        enrolled = report.enrolled,
        skipped = report.skipped,
        rejected = report.rejected.len(),
        "enrollment finished"
    );
    Ok(report)
}

/// Verify the candidate and open the exam session
async fn start_exam(service: &ProctorService, run: &RunConfig) -> anyhow::Result<Uuid> {
    let identity = run
        .identity
        .as_deref()
        .context("run.identity is required in exam mode")?;
    let reference = run
        .reference_image
        .as_ref()
        .context("run.reference_image is required in exam mode")?;
    let image = tokio::fs::read(reference)
        .await
        .with_context(|| format!("cannot read {}", reference.display()))?;

    match service
        .start_session(&run.exam_code, &IdentityId::from(identity), &image)
        .await?
    {
        SessionStart::Started { session, .. } => Ok(session.session_id),
        SessionStart::Rejected {
            similarity,
            threshold,
        } => bail!(
            "identity verification failed for {identity}: similarity {similarity:.3} below {threshold:.3}"
        ),
    }
}

/// Run one monitored stream until the source ends, the session ends, or
/// ctrl-c
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let service = build_service(&config).await?;

    if let Some(directory) = &config.run.enrollment_dir {
        enroll_directory(&service, directory).await?;
    }

    let mode = match config.run.mode {
        RunMode::Detection => MonitorMode::Detection,
        RunMode::Exam => MonitorMode::Exam {
            session_id: start_exam(&service, &config.run).await?,
            service: service.clone(),
        },
        RunMode::Recognition => MonitorMode::Recognition {
            service: service.clone(),
        },
    };

    let source = DirectorySource::open(&config.camera)?;
    let registry = StatsRegistry::new();
    let handle = StreamMonitor::spawn(
        config.stream.clone(),
        Box::new(source),
        service.analyzer().clone(),
        mode.clone(),
        &registry,
    )?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
        }
        _ = handle.finished() => {}
    }

    let snapshot = handle.stop().await;
    info!(stats = %serde_json::to_string(&snapshot)?, "stream summary");
    if matches!(mode, MonitorMode::Recognition { .. }) {
        info!(
            recognized = snapshot.faces_recognized,
            last_frame = %serde_json::to_string(&snapshot.last_recognitions)?,
            "recognition summary"
        );
    }

    if let MonitorMode::Exam { service, session_id } = mode {
        let session = service.get_status(session_id).await?;
        if !session.status.is_terminal() {
            service.end_session(session_id).await?;
        }
        let summary = service.incident_summary(session_id).await?;
        info!(
            session_id = %session_id,
            incidents = summary.total,
            by_kind = %serde_json::to_string(&summary.by_kind)?,
            "session summary"
        );
    }
    Ok(())
}
