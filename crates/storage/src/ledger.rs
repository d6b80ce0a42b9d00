//! Incident ledger

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::records::{Incident, IncidentKind};
use crate::{ProctorStore, StorageError};

/// Aggregate view of a session's incidents
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentSummary {
    pub total: usize,
    pub by_kind: BTreeMap<IncidentKind, usize>,
    /// Most recent entries, oldest first
    pub latest: Vec<Incident>,
}

/// Append-only, time-ordered record of policy events per session.
///
/// Timestamps come from the injected clock so window queries can be tested
/// without real time passing.
#[derive(Clone)]
pub struct IncidentLedger {
    store: Arc<dyn ProctorStore>,
    clock: Arc<dyn Clock>,
}

impl IncidentLedger {
    pub fn new(store: Arc<dyn ProctorStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Record an incident at the current clock time
    pub async fn append(
        &self,
        session_id: Uuid,
        kind: IncidentKind,
        details: Option<&str>,
    ) -> Result<Incident, StorageError> {
        let incident = self
            .store
            .append_incident(session_id, kind, details, self.clock.now())
            .await?;
        counter!("proctor_incidents_total", "kind" => kind.as_str()).increment(1);
        debug!(%session_id, kind = %kind, seq = incident.seq, "incident appended");
        Ok(incident)
    }

    /// Entries of `kind` with `occurred_at >= now - window`
    pub async fn count_within_window(
        &self,
        session_id: Uuid,
        kind: IncidentKind,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.store
            .count_incidents_since(session_id, kind, now - window)
            .await
    }

    /// Full history of a session in ledger order
    pub async fn history(&self, session_id: Uuid) -> Result<Vec<Incident>, StorageError> {
        self.store.list_incidents(session_id).await
    }

    /// Totals per kind plus the `latest` most recent entries
    pub async fn summary(
        &self,
        session_id: Uuid,
        latest: usize,
    ) -> Result<IncidentSummary, StorageError> {
        let history = self.history(session_id).await?;

        let mut by_kind = BTreeMap::new();
        for incident in &history {
            *by_kind.entry(incident.kind).or_insert(0) += 1;
        }

        let skip = history.len().saturating_sub(latest);
        Ok(IncidentSummary {
            total: history.len(),
            by_kind,
            latest: history.into_iter().skip(skip).collect(),
        })
    }
}
