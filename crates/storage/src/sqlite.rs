//! SQLite store

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use face_auth::{Embedding, IdentityId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::records::{
    AttendanceRecord, ExamRecord, IdentityRecord, IdentitySummary, Incident, IncidentKind,
    SessionRecord, SessionStatus, TemplateRecord,
};
use crate::{ProctorStore, StorageError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS identities (
        identity_id TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        enrolled_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS templates (
        template_id INTEGER PRIMARY KEY AUTOINCREMENT,
        identity_id TEXT NOT NULL REFERENCES identities(identity_id),
        embedding TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS exams (
        exam_id INTEGER PRIMARY KEY AUTOINCREMENT,
        code TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        exam_id INTEGER NOT NULL REFERENCES exams(exam_id),
        identity_id TEXT NOT NULL,
        status TEXT NOT NULL,
        lock_reason TEXT,
        started_at_ms INTEGER NOT NULL,
        ended_at_ms INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS incidents (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        details TEXT,
        occurred_at_ms INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_incidents_window
        ON incidents (session_id, kind, occurred_at_ms)",
    "CREATE TABLE IF NOT EXISTS attendance (
        record_id INTEGER PRIMARY KEY AUTOINCREMENT,
        identity_id TEXT NOT NULL,
        class_name TEXT,
        label TEXT,
        similarity REAL NOT NULL,
        attended_at_ms INTEGER NOT NULL
    )",
];

/// Store backed by a SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url`, e.g.
    /// `sqlite://proctor.db` or `sqlite::memory:`
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_err)?
            .create_if_missing(true);

        // An in-memory database lives and dies with its connection.
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .idle_timeout(None::<std::time::Duration>)
            .max_lifetime(None::<std::time::Duration>)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, "SQLite store ready");
        Ok(store)
    }

    /// In-memory database, mostly for tests
    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::DatabaseError(e.to_string())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StorageError::SerializationError(format!("timestamp out of range: {ms}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(s).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn identity_from_row(row: &SqliteRow) -> Result<IdentityRecord, StorageError> {
    Ok(IdentityRecord {
        identity_id: IdentityId::new(row.try_get::<String, _>("identity_id").map_err(db_err)?),
        display_name: row.try_get("display_name").map_err(db_err)?,
        enrolled_at: from_millis(row.try_get("enrolled_at_ms").map_err(db_err)?)?,
    })
}

fn template_from_row(row: &SqliteRow) -> Result<TemplateRecord, StorageError> {
    let raw: String = row.try_get("embedding").map_err(db_err)?;
    let values: Vec<f32> = serde_json::from_str(&raw)
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;
    Ok(TemplateRecord {
        template_id: row.try_get("template_id").map_err(db_err)?,
        identity_id: IdentityId::new(row.try_get::<String, _>("identity_id").map_err(db_err)?),
        embedding: Embedding::new(values),
        created_at: from_millis(row.try_get("created_at_ms").map_err(db_err)?)?,
    })
}

fn exam_from_row(row: &SqliteRow) -> Result<ExamRecord, StorageError> {
    Ok(ExamRecord {
        exam_id: row.try_get("exam_id").map_err(db_err)?,
        code: row.try_get("code").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        created_at: from_millis(row.try_get("created_at_ms").map_err(db_err)?)?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord, StorageError> {
    let ended_at: Option<i64> = row.try_get("ended_at_ms").map_err(db_err)?;
    Ok(SessionRecord {
        session_id: parse_uuid(&row.try_get::<String, _>("session_id").map_err(db_err)?)?,
        exam_id: row.try_get("exam_id").map_err(db_err)?,
        identity_id: IdentityId::new(row.try_get::<String, _>("identity_id").map_err(db_err)?),
        status: row
            .try_get::<String, _>("status")
            .map_err(db_err)?
            .parse::<SessionStatus>()?,
        lock_reason: row.try_get("lock_reason").map_err(db_err)?,
        started_at: from_millis(row.try_get("started_at_ms").map_err(db_err)?)?,
        ended_at: ended_at.map(from_millis).transpose()?,
    })
}

fn incident_from_row(row: &SqliteRow) -> Result<Incident, StorageError> {
    Ok(Incident {
        seq: row.try_get("seq").map_err(db_err)?,
        session_id: parse_uuid(&row.try_get::<String, _>("session_id").map_err(db_err)?)?,
        kind: row
            .try_get::<String, _>("kind")
            .map_err(db_err)?
            .parse::<IncidentKind>()?,
        details: row.try_get("details").map_err(db_err)?,
        occurred_at: from_millis(row.try_get("occurred_at_ms").map_err(db_err)?)?,
    })
}

fn attendance_from_row(row: &SqliteRow) -> Result<AttendanceRecord, StorageError> {
    Ok(AttendanceRecord {
        record_id: row.try_get("record_id").map_err(db_err)?,
        identity_id: IdentityId::new(row.try_get::<String, _>("identity_id").map_err(db_err)?),
        class_name: row.try_get("class_name").map_err(db_err)?,
        label: row.try_get("label").map_err(db_err)?,
        similarity: row.try_get::<f64, _>("similarity").map_err(db_err)? as f32,
        attended_at: from_millis(row.try_get("attended_at_ms").map_err(db_err)?)?,
    })
}

#[async_trait]
impl ProctorStore for SqliteStore {
    async fn insert_identity(&self, identity: &IdentityRecord) -> Result<(), StorageError> {
        if self.get_identity(&identity.identity_id).await?.is_some() {
            return Err(StorageError::AlreadyExists(identity.identity_id.to_string()));
        }
        sqlx::query(
            "INSERT INTO identities (identity_id, display_name, enrolled_at_ms) VALUES (?, ?, ?)",
        )
        .bind(identity.identity_id.as_str())
        .bind(&identity.display_name)
        .bind(to_millis(identity.enrolled_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_identity(&self, id: &IdentityId) -> Result<Option<IdentityRecord>, StorageError> {
        sqlx::query("SELECT * FROM identities WHERE identity_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(identity_from_row)
            .transpose()
    }

    async fn list_identities(&self) -> Result<Vec<IdentitySummary>, StorageError> {
        let rows = sqlx::query(
            "SELECT i.identity_id, i.display_name, i.enrolled_at_ms,
                    (SELECT COUNT(*) FROM templates t WHERE t.identity_id = i.identity_id) AS template_count
             FROM identities i
             ORDER BY i.enrolled_at_ms, i.rowid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(IdentitySummary {
                    identity: identity_from_row(row)?,
                    template_count: row.try_get::<i64, _>("template_count").map_err(db_err)?
                        as usize,
                })
            })
            .collect()
    }

    async fn insert_template(
        &self,
        identity: &IdentityId,
        embedding: &Embedding,
        created_at: DateTime<Utc>,
    ) -> Result<TemplateRecord, StorageError> {
        if self.get_identity(identity).await?.is_none() {
            return Err(StorageError::NotFound);
        }
        let raw = serde_json::to_string(&embedding.values)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let stored_ms = to_millis(created_at);
        let result = sqlx::query(
            "INSERT INTO templates (identity_id, embedding, created_at_ms) VALUES (?, ?, ?)",
        )
        .bind(identity.as_str())
        .bind(raw)
        .bind(stored_ms)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let template_id = result.last_insert_rowid();
        debug!(identity = %identity, template_id, "template stored");
        Ok(TemplateRecord {
            template_id,
            identity_id: identity.clone(),
            embedding: embedding.clone(),
            created_at: from_millis(stored_ms)?,
        })
    }

    async fn load_templates(&self) -> Result<Vec<TemplateRecord>, StorageError> {
        sqlx::query("SELECT * FROM templates ORDER BY template_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(template_from_row)
            .collect()
    }

    async fn get_or_create_exam(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<ExamRecord, StorageError> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO exams (code, title, created_at_ms) VALUES (?, ?, ?)")
                .bind(code)
                .bind(code)
                .bind(to_millis(now))
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        if result.rows_affected() > 0 {
            info!(code, "exam created");
        }

        let row = sqlx::query("SELECT * FROM exams WHERE code = ?")
            .bind(code)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        exam_from_row(&row)
    }

    async fn insert_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO sessions
                (session_id, exam_id, identity_id, status, lock_reason, started_at_ms, ended_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.session_id.to_string())
        .bind(session.exam_id)
        .bind(session.identity_id.as_str())
        .bind(session.status.as_str())
        .bind(session.lock_reason.as_deref())
        .bind(to_millis(session.started_at))
        .bind(session.ended_at.map(to_millis))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StorageError> {
        sqlx::query("SELECT * FROM sessions WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(session_from_row)
            .transpose()
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE sessions
             SET status = ?, lock_reason = ?, ended_at_ms = ?
             WHERE session_id = ?",
        )
        .bind(session.status.as_str())
        .bind(session.lock_reason.as_deref())
        .bind(session.ended_at.map(to_millis))
        .bind(session.session_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn append_incident(
        &self,
        session_id: Uuid,
        kind: IncidentKind,
        details: Option<&str>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Incident, StorageError> {
        let stored_ms = to_millis(occurred_at);
        let result = sqlx::query(
            "INSERT INTO incidents (session_id, kind, details, occurred_at_ms) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id.to_string())
        .bind(kind.as_str())
        .bind(details)
        .bind(stored_ms)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Incident {
            seq: result.last_insert_rowid(),
            session_id,
            kind,
            details: details.map(str::to_string),
            occurred_at: from_millis(stored_ms)?,
        })
    }

    async fn count_incidents_since(
        &self,
        session_id: Uuid,
        kind: IncidentKind,
        since: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM incidents
             WHERE session_id = ? AND kind = ? AND occurred_at_ms >= ?",
        )
        .bind(session_id.to_string())
        .bind(kind.as_str())
        .bind(to_millis(since))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count as usize)
    }

    async fn list_incidents(&self, session_id: Uuid) -> Result<Vec<Incident>, StorageError> {
        sqlx::query("SELECT * FROM incidents WHERE session_id = ? ORDER BY occurred_at_ms, seq")
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .iter()
            .map(incident_from_row)
            .collect()
    }

    async fn insert_attendance(
        &self,
        identity: &IdentityId,
        class_name: Option<&str>,
        label: Option<&str>,
        similarity: f32,
        attended_at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, StorageError> {
        let stored_ms = to_millis(attended_at);
        let result = sqlx::query(
            "INSERT INTO attendance (identity_id, class_name, label, similarity, attended_at_ms)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(identity.as_str())
        .bind(class_name)
        .bind(label)
        .bind(f64::from(similarity))
        .bind(stored_ms)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(AttendanceRecord {
            record_id: result.last_insert_rowid(),
            identity_id: identity.clone(),
            class_name: class_name.map(str::to_string),
            label: label.map(str::to_string),
            similarity,
            attended_at: from_millis(stored_ms)?,
        })
    }

    async fn list_attendance_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttendanceRecord>, StorageError> {
        sqlx::query(
            "SELECT * FROM attendance WHERE attended_at_ms >= ?
             ORDER BY attended_at_ms DESC, record_id DESC",
        )
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(attendance_from_row)
        .collect()
    }
}
