//! Stored record types

use chrono::{DateTime, Utc};
use face_auth::{Embedding, IdentityId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::StorageError;

/// Enrolled person
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub identity_id: IdentityId,
    pub display_name: String,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub identity: IdentityRecord,
    pub template_count: usize,
}

/// One stored face template, raw as extracted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub template_id: i64,
    pub identity_id: IdentityId,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamRecord {
    pub exam_id: i64,
    pub code: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Proctoring session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Locked,
    Completed,
    Aborted,
}

impl SessionStatus {
    /// `Completed` and `Aborted` are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Locked => "locked",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "locked" => Ok(SessionStatus::Locked),
            "completed" => Ok(SessionStatus::Completed),
            "aborted" => Ok(SessionStatus::Aborted),
            other => Err(StorageError::SerializationError(format!(
                "unknown session status '{other}'"
            ))),
        }
    }
}

/// Proctoring session row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub exam_id: i64,
    /// Identity the session was opened for
    pub identity_id: IdentityId,
    pub status: SessionStatus,
    pub lock_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(exam_id: i64, identity_id: IdentityId, started_at: DateTime<Utc>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            exam_id,
            identity_id,
            status: SessionStatus::Active,
            lock_reason: None,
            started_at,
            ended_at: None,
        }
    }
}

/// Policy-relevant event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    NoFace,
    MultipleFaces,
    FaceMismatch,
    LookingAway,
    ManualUnlock,
    SessionAborted,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::NoFace => "no_face",
            IncidentKind::MultipleFaces => "multiple_faces",
            IncidentKind::FaceMismatch => "face_mismatch",
            IncidentKind::LookingAway => "looking_away",
            IncidentKind::ManualUnlock => "manual_unlock",
            IncidentKind::SessionAborted => "session_aborted",
        }
    }
}

impl fmt::Display for IncidentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_face" => Ok(IncidentKind::NoFace),
            "multiple_faces" => Ok(IncidentKind::MultipleFaces),
            "face_mismatch" => Ok(IncidentKind::FaceMismatch),
            "looking_away" => Ok(IncidentKind::LookingAway),
            "manual_unlock" => Ok(IncidentKind::ManualUnlock),
            "session_aborted" => Ok(IncidentKind::SessionAborted),
            other => Err(StorageError::SerializationError(format!(
                "unknown incident kind '{other}'"
            ))),
        }
    }
}

/// Ledger entry, never mutated once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Insertion order, breaks `occurred_at` ties
    pub seq: i64,
    pub session_id: Uuid,
    pub kind: IncidentKind,
    pub details: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub record_id: i64,
    pub identity_id: IdentityId,
    pub class_name: Option<String>,
    pub label: Option<String>,
    pub similarity: f32,
    pub attended_at: DateTime<Utc>,
}
