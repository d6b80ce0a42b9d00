//! Caller-facing error taxonomy

use face_analysis::AnalysisError;
use face_auth::{IdentityId, MatchError};
use storage::{SessionStatus, StorageError};
use thiserror::Error;
use uuid::Uuid;

/// Broad category of a [`ProctorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected before any state was touched
    Input,
    /// A detection or matching collaborator failed
    Collaborator,
    /// Persistence failed; the requested transition did not happen
    Storage,
}

/// Proctoring errors.
///
/// Policy outcomes (mismatch, multiple faces, no face) are never errors;
/// they are reported through verdicts and session status.
#[derive(Error, Debug)]
pub enum ProctorError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("No identities enrolled")]
    EmptyGallery,

    #[error("Unknown session: {0}")]
    UnknownSession(Uuid),

    #[error("Unknown identity: {0}")]
    UnknownIdentity(IdentityId),

    #[error("Identity already enrolled: {0}")]
    DuplicateIdentity(IdentityId),

    #[error("No face detected")]
    NoFaceDetected,

    #[error("Cannot {action} session {session_id} in status {status}")]
    InvalidTransition {
        session_id: Uuid,
        status: SessionStatus,
        action: &'static str,
    },

    #[error("Face analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    /// Template a caller tried to enroll that the gallery cannot hold
    #[error("Template rejected: {0}")]
    InvalidTemplate(MatchError),

    #[error("Embedding rejected: {0}")]
    Matching(#[from] MatchError),

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl ProctorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProctorError::InvalidImage(_)
            | ProctorError::EmptyGallery
            | ProctorError::UnknownSession(_)
            | ProctorError::UnknownIdentity(_)
            | ProctorError::DuplicateIdentity(_)
            | ProctorError::NoFaceDetected
            | ProctorError::InvalidTemplate(_)
            | ProctorError::InvalidTransition { .. } => ErrorCategory::Input,
            ProctorError::Analysis(_) | ProctorError::Matching(_) => ErrorCategory::Collaborator,
            ProctorError::Storage(_) => ErrorCategory::Storage,
        }
    }
}
