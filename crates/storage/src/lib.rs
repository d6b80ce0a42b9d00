//! Storage Layer
//!
//! Durable state for the proctoring engine behind the `ProctorStore` trait:
//! identities and their face templates, exams, sessions, the append-only
//! incident ledger and attendance marks. Two implementations are provided,
//! an in-memory store and SQLite via `sqlx`.

mod clock;
mod ledger;
mod memory;
mod records;
mod sqlite;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ledger::{IncidentLedger, IncidentSummary};
pub use memory::InMemoryStore;
pub use records::{
    AttendanceRecord, ExamRecord, IdentityRecord, IdentitySummary, Incident, IncidentKind,
    SessionRecord, SessionStatus, TemplateRecord,
};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use face_auth::{Embedding, IdentityId};
use thiserror::Error;
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Record not found")]
    NotFound,
    #[error("Record already exists: {0}")]
    AlreadyExists(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Persistence operations the proctoring engine relies on.
///
/// Implementations must be safe to call concurrently for different
/// sessions.
#[async_trait]
pub trait ProctorStore: Send + Sync {
    async fn insert_identity(&self, identity: &IdentityRecord) -> Result<(), StorageError>;

    async fn get_identity(&self, id: &IdentityId) -> Result<Option<IdentityRecord>, StorageError>;

    /// All identities with their template counts, in enrollment order
    async fn list_identities(&self) -> Result<Vec<IdentitySummary>, StorageError>;

    async fn insert_template(
        &self,
        identity: &IdentityId,
        embedding: &Embedding,
        created_at: DateTime<Utc>,
    ) -> Result<TemplateRecord, StorageError>;

    /// Every template in insertion order
    async fn load_templates(&self) -> Result<Vec<TemplateRecord>, StorageError>;

    async fn get_or_create_exam(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<ExamRecord, StorageError>;

    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StorageError>;

    async fn get_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StorageError>;

    /// Overwrite an existing session, `NotFound` if there is none
    async fn update_session(&self, session: &SessionRecord) -> Result<(), StorageError>;

    async fn append_incident(
        &self,
        session_id: Uuid,
        kind: IncidentKind,
        details: Option<&str>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Incident, StorageError>;

    /// Incidents of `kind` for the session with `occurred_at >= since`
    async fn count_incidents_since(
        &self,
        session_id: Uuid,
        kind: IncidentKind,
        since: DateTime<Utc>,
    ) -> Result<usize, StorageError>;

    /// Ordered by `occurred_at`, ties by insertion order
    async fn list_incidents(&self, session_id: Uuid) -> Result<Vec<Incident>, StorageError>;

    async fn insert_attendance(
        &self,
        identity: &IdentityId,
        class_name: Option<&str>,
        label: Option<&str>,
        similarity: f32,
        attended_at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, StorageError>;

    /// Newest first
    async fn list_attendance_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttendanceRecord>, StorageError>;
}
