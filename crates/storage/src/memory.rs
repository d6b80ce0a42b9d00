//! In-memory store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use face_auth::{Embedding, IdentityId};
use tracing::{debug, info};
use uuid::Uuid;

use crate::records::{
    AttendanceRecord, ExamRecord, IdentityRecord, IdentitySummary, Incident, IncidentKind,
    SessionRecord, TemplateRecord,
};
use crate::{ProctorStore, StorageError};

#[derive(Default)]
struct Tables {
    identities: Vec<IdentityRecord>,
    templates: Vec<TemplateRecord>,
    exams: Vec<ExamRecord>,
    sessions: HashMap<Uuid, SessionRecord>,
    incidents: Vec<Incident>,
    attendance: Vec<AttendanceRecord>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Store that keeps everything in process memory.
///
/// Can be switched into an unavailable state to exercise storage failure
/// handling.
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        info!("Creating in-memory store");
        Self {
            tables: Mutex::new(Tables::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with a database error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::DatabaseError("store unavailable".to_string()));
        }
        self.tables
            .lock()
            .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProctorStore for InMemoryStore {
    async fn insert_identity(&self, identity: &IdentityRecord) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        if tables
            .identities
            .iter()
            .any(|i| i.identity_id == identity.identity_id)
        {
            return Err(StorageError::AlreadyExists(identity.identity_id.to_string()));
        }
        tables.identities.push(identity.clone());
        Ok(())
    }

    async fn get_identity(&self, id: &IdentityId) -> Result<Option<IdentityRecord>, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .identities
            .iter()
            .find(|i| &i.identity_id == id)
            .cloned())
    }

    async fn list_identities(&self) -> Result<Vec<IdentitySummary>, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .identities
            .iter()
            .map(|identity| IdentitySummary {
                template_count: tables
                    .templates
                    .iter()
                    .filter(|t| t.identity_id == identity.identity_id)
                    .count(),
                identity: identity.clone(),
            })
            .collect())
    }

    async fn insert_template(
        &self,
        identity: &IdentityId,
        embedding: &Embedding,
        created_at: DateTime<Utc>,
    ) -> Result<TemplateRecord, StorageError> {
        let mut tables = self.tables()?;
        if !tables.identities.iter().any(|i| &i.identity_id == identity) {
            return Err(StorageError::NotFound);
        }
        let record = TemplateRecord {
            template_id: tables.next_id(),
            identity_id: identity.clone(),
            embedding: embedding.clone(),
            created_at,
        };
        tables.templates.push(record.clone());
        debug!(identity = %identity, template_id = record.template_id, "template stored");
        Ok(record)
    }

    async fn load_templates(&self) -> Result<Vec<TemplateRecord>, StorageError> {
        Ok(self.tables()?.templates.clone())
    }

    async fn get_or_create_exam(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<ExamRecord, StorageError> {
        let mut tables = self.tables()?;
        if let Some(exam) = tables.exams.iter().find(|e| e.code == code) {
            return Ok(exam.clone());
        }
        let exam = ExamRecord {
            exam_id: tables.next_id(),
            code: code.to_string(),
            title: code.to_string(),
            created_at: now,
        };
        tables.exams.push(exam.clone());
        info!(code, exam_id = exam.exam_id, "exam created");
        Ok(exam)
    }

    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        if tables.sessions.contains_key(&session.session_id) {
            return Err(StorageError::AlreadyExists(session.session_id.to_string()));
        }
        tables.sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StorageError> {
        Ok(self.tables()?.sessions.get(&session_id).cloned())
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        match tables.sessions.get_mut(&session.session_id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound),
        }
    }

    async fn append_incident(
        &self,
        session_id: Uuid,
        kind: IncidentKind,
        details: Option<&str>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Incident, StorageError> {
        let mut tables = self.tables()?;
        let incident = Incident {
            seq: tables.next_id(),
            session_id,
            kind,
            details: details.map(str::to_string),
            occurred_at,
        };
        tables.incidents.push(incident.clone());
        Ok(incident)
    }

    async fn count_incidents_since(
        &self,
        session_id: Uuid,
        kind: IncidentKind,
        since: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .incidents
            .iter()
            .filter(|i| i.session_id == session_id && i.kind == kind && i.occurred_at >= since)
            .count())
    }

    async fn list_incidents(&self, session_id: Uuid) -> Result<Vec<Incident>, StorageError> {
        let tables = self.tables()?;
        let mut incidents: Vec<Incident> = tables
            .incidents
            .iter()
            .filter(|i| i.session_id == session_id)
            .cloned()
            .collect();
        incidents.sort_by_key(|i| (i.occurred_at, i.seq));
        Ok(incidents)
    }

    async fn insert_attendance(
        &self,
        identity: &IdentityId,
        class_name: Option<&str>,
        label: Option<&str>,
        similarity: f32,
        attended_at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, StorageError> {
        let mut tables = self.tables()?;
        let record = AttendanceRecord {
            record_id: tables.next_id(),
            identity_id: identity.clone(),
            class_name: class_name.map(str::to_string),
            label: label.map(str::to_string),
            similarity,
            attended_at,
        };
        tables.attendance.push(record.clone());
        Ok(record)
    }

    async fn list_attendance_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttendanceRecord>, StorageError> {
        let tables = self.tables()?;
        let mut records: Vec<AttendanceRecord> = tables
            .attendance
            .iter()
            .filter(|r| r.attended_at >= since)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.attended_at
                .cmp(&a.attended_at)
                .then(b.record_id.cmp(&a.record_id))
        });
        Ok(records)
    }
}
