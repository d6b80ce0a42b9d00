//! Proctoring service: the operations exposed to callers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use camera_capture::{decode_image, VideoFrame};
use chrono::{DateTime, Utc};
use face_analysis::{BoundingBox, FaceAnalyzer, FaceSample, FrameSignals};
use face_auth::{
    Embedding, Gallery, Identification, IdentityId, MatchError, MatchResult, UnitEmbedding,
    Verdict,
};
use serde::Serialize;
use storage::{
    AttendanceRecord, Clock, IdentityRecord, IdentitySummary, Incident, IncidentLedger,
    IncidentSummary, ProctorStore, SessionRecord, SessionStatus, TemplateRecord,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::machine::{FrameObservation, FrameVerdict, SessionCounters, SessionMachine};
use crate::{ProctorConfig, ProctorError};

/// Entries returned in an incident summary
const SUMMARY_LATEST: usize = 20;

/// Result of `start_session`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionStart {
    Started {
        session: SessionRecord,
        similarity: f32,
    },
    Rejected {
        similarity: f32,
        threshold: f32,
    },
}

/// Best gallery match for one face of a live frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceRecognition {
    pub bbox: BoundingBox,
    /// `None` when the face had no usable embedding
    pub best_match: Option<MatchResult>,
    /// The best match reached the acceptance threshold
    pub recognized: bool,
}

type SessionSlot = Arc<AsyncMutex<SessionCounters>>;

/// A session loaded for a transition
enum Held {
    /// Not terminal; the slot lock is held until this is dropped
    Live {
        session: SessionRecord,
        counters: OwnedMutexGuard<SessionCounters>,
    },
    Terminal(SessionRecord),
}

impl Held {
    fn into_parts(self) -> (SessionRecord, Option<OwnedMutexGuard<SessionCounters>>) {
        match self {
            Held::Live { session, counters } => (session, Some(counters)),
            Held::Terminal(session) => (session, None),
        }
    }
}

/// Identity verification, enrollment, attendance and session proctoring.
///
/// Every operation on a session runs under that session's own lock, so
/// transitions on one session are linearizable while different sessions
/// proceed independently.
pub struct ProctorService {
    config: ProctorConfig,
    store: Arc<dyn ProctorStore>,
    clock: Arc<dyn Clock>,
    ledger: IncidentLedger,
    analyzer: FaceAnalyzer,
    machine: SessionMachine,
    gallery: RwLock<Arc<Gallery>>,
    slots: Mutex<HashMap<Uuid, SessionSlot>>,
    sequence: AtomicU64,
}

impl ProctorService {
    /// Create the service and load the gallery from the store
    pub async fn new(
        config: ProctorConfig,
        store: Arc<dyn ProctorStore>,
        clock: Arc<dyn Clock>,
        analyzer: FaceAnalyzer,
    ) -> Result<Self, ProctorError> {
        let ledger = IncidentLedger::new(store.clone(), clock.clone());
        let machine = SessionMachine::new(config.clone(), store.clone(), ledger.clone());
        let service = Self {
            config,
            store,
            clock,
            ledger,
            analyzer,
            machine,
            gallery: RwLock::new(Arc::new(Gallery::new())),
            slots: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        };
        service.reload_gallery().await?;
        Ok(service)
    }

    pub fn config(&self) -> &ProctorConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &FaceAnalyzer {
        &self.analyzer
    }

    /// Current gallery snapshot
    pub fn gallery(&self) -> Arc<Gallery> {
        self.gallery
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Rebuild the gallery from stored templates, returning its size
    pub async fn reload_gallery(&self) -> Result<usize, ProctorError> {
        let templates = self.store.load_templates().await?;
        let gallery = Gallery::from_templates(
            templates
                .into_iter()
                .map(|t| (t.identity_id, t.embedding)),
        )?;
        let size = gallery.len();
        *self.gallery.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(gallery);
        info!(templates = size, "gallery reloaded");
        Ok(size)
    }

    fn decode(&self, image: &[u8]) -> Result<Arc<VideoFrame>, ProctorError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp_ns = self
            .clock
            .now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .max(0) as u64;
        decode_image(image, timestamp_ns, sequence)
            .map(Arc::new)
            .map_err(|e| ProctorError::InvalidImage(e.to_string()))
    }

    /// Unit embedding of the face in `image`
    async fn query_embedding(&self, image: &[u8]) -> Result<UnitEmbedding, ProctorError> {
        let frame = self.decode(image)?;
        let extraction = self
            .analyzer
            .extract(frame)
            .await?
            .ok_or(ProctorError::NoFaceDetected)?;
        Ok(UnitEmbedding::normalize(extraction.embedding)?)
    }

    fn non_empty_gallery(&self) -> Result<Arc<Gallery>, ProctorError> {
        let gallery = self.gallery();
        if gallery.is_empty() {
            return Err(ProctorError::EmptyGallery);
        }
        Ok(gallery)
    }

    /// Reject embeddings the gallery could not hold, before anything is written
    fn check_template(&self, embedding: &Embedding) -> Result<(), ProctorError> {
        let unit =
            UnitEmbedding::normalize(embedding.clone()).map_err(ProctorError::InvalidTemplate)?;
        if let Some(expected) = self.gallery().dimension() {
            if unit.dimension() != expected {
                return Err(ProctorError::InvalidTemplate(MatchError::DimensionMismatch {
                    expected,
                    actual: unit.dimension(),
                }));
            }
        }
        Ok(())
    }

    async fn require_identity(&self, id: &IdentityId) -> Result<IdentityRecord, ProctorError> {
        self.store
            .get_identity(id)
            .await?
            .ok_or_else(|| ProctorError::UnknownIdentity(id.clone()))
    }

    /// Register a new identity with its first template
    pub async fn enroll_identity(
        &self,
        identity_id: IdentityId,
        display_name: &str,
        image: &[u8],
    ) -> Result<IdentityRecord, ProctorError> {
        if self.store.get_identity(&identity_id).await?.is_some() {
            return Err(ProctorError::DuplicateIdentity(identity_id));
        }
        let frame = self.decode(image)?;
        let extraction = self
            .analyzer
            .extract(frame)
            .await?
            .ok_or(ProctorError::NoFaceDetected)?;
        self.check_template(&extraction.embedding)?;

        let now = self.clock.now();
        let record = IdentityRecord {
            identity_id: identity_id.clone(),
            display_name: display_name.to_string(),
            enrolled_at: now,
        };
        self.store.insert_identity(&record).await?;
        self.store
            .insert_template(&identity_id, &extraction.embedding, now)
            .await?;
        self.reload_gallery().await?;

        info!(identity = %identity_id, "identity enrolled");
        Ok(record)
    }

    /// Attach another template to an enrolled identity
    pub async fn add_template(
        &self,
        identity_id: &IdentityId,
        image: &[u8],
    ) -> Result<TemplateRecord, ProctorError> {
        self.require_identity(identity_id).await?;
        let frame = self.decode(image)?;
        let extraction = self
            .analyzer
            .extract(frame)
            .await?
            .ok_or(ProctorError::NoFaceDetected)?;
        self.check_template(&extraction.embedding)?;

        let template = self
            .store
            .insert_template(identity_id, &extraction.embedding, self.clock.now())
            .await?;
        self.reload_gallery().await?;

        info!(identity = %identity_id, template_id = template.template_id, "template added");
        Ok(template)
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentitySummary>, ProctorError> {
        Ok(self.store.list_identities().await?)
    }

    /// Check that `image` shows `expected`
    pub async fn verify_identity(
        &self,
        expected: &IdentityId,
        image: &[u8],
    ) -> Result<Verdict, ProctorError> {
        let gallery = self.non_empty_gallery()?;
        self.require_identity(expected).await?;
        let query = self.query_embedding(image).await?;

        let verdict = gallery.verify(expected, &query, self.config.acceptance_threshold)?;
        debug!(identity = %expected, ?verdict, "identity verified");
        Ok(verdict)
    }

    /// Identify the face against everyone enrolled and record attendance
    /// when recognized
    pub async fn mark_attendance(
        &self,
        image: &[u8],
        class_name: Option<&str>,
        label: Option<&str>,
    ) -> Result<Identification, ProctorError> {
        let gallery = self.non_empty_gallery()?;
        let query = self.query_embedding(image).await?;

        let identification = gallery.identify(&query, self.config.acceptance_threshold)?;
        if let Identification::Recognized {
            identity,
            similarity,
        } = &identification
        {
            self.store
                .insert_attendance(identity, class_name, label, *similarity, self.clock.now())
                .await?;
            info!(identity = %identity, class_name, "attendance marked");
        }
        Ok(identification)
    }

    /// Attendance records since `since`, newest first
    pub async fn attendance_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttendanceRecord>, ProctorError> {
        Ok(self.store.list_attendance_since(since).await?)
    }

    /// Verify the candidate and open a session for the exam
    pub async fn start_session(
        &self,
        exam_code: &str,
        identity_id: &IdentityId,
        image: &[u8],
    ) -> Result<SessionStart, ProctorError> {
        let verdict = self.verify_identity(identity_id, image).await?;
        let similarity = match verdict {
            Verdict::Accept { similarity } => similarity,
            Verdict::Reject {
                similarity,
                threshold,
            } => {
                info!(identity = %identity_id, exam_code, similarity, "session start rejected");
                return Ok(SessionStart::Rejected {
                    similarity,
                    threshold,
                });
            }
        };

        let now = self.clock.now();
        let exam = self.store.get_or_create_exam(exam_code, now).await?;
        let session = SessionRecord::new(exam.exam_id, identity_id.clone(), now);
        self.store.insert_session(&session).await?;

        info!(
            session_id = %session.session_id,
            identity = %identity_id,
            exam_code,
            similarity,
            "session started"
        );
        Ok(SessionStart::Started {
            session,
            similarity,
        })
    }

    fn slot(&self, session_id: Uuid) -> SessionSlot {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id)
            .or_default()
            .clone()
    }

    fn release_slot(&self, session_id: Uuid) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session_id);
    }

    /// Sessions currently holding a lock slot
    pub fn tracked_sessions(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn load_session(&self, session_id: Uuid) -> Result<SessionRecord, ProctorError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or(ProctorError::UnknownSession(session_id))
    }

    /// Load a session under its slot lock.
    ///
    /// Unknown and terminal sessions never get a slot; the record is
    /// re-read once the lock is held so a concurrent end is observed.
    async fn lock_session(&self, session_id: Uuid) -> Result<Held, ProctorError> {
        let session = self.load_session(session_id).await?;
        if session.status.is_terminal() {
            return Ok(Held::Terminal(session));
        }

        let counters = self.slot(session_id).lock_owned().await;
        let session = self.load_session(session_id).await?;
        if session.status.is_terminal() {
            drop(counters);
            self.release_slot(session_id);
            return Ok(Held::Terminal(session));
        }
        Ok(Held::Live { session, counters })
    }

    /// Decode and evaluate one monitoring frame
    pub async fn process_frame(
        &self,
        session_id: Uuid,
        image: &[u8],
    ) -> Result<FrameVerdict, ProctorError> {
        let frame = self.decode(image)?;
        self.process_decoded(session_id, frame).await
    }

    /// Evaluate an already decoded frame
    pub async fn process_decoded(
        &self,
        session_id: Uuid,
        frame: Arc<VideoFrame>,
    ) -> Result<FrameVerdict, ProctorError> {
        let (mut session, mut counters) = match self.lock_session(session_id).await? {
            Held::Live { session, counters } => (session, counters),
            Held::Terminal(session) => return Ok(FrameVerdict::from(&session)),
        };
        if session.status != SessionStatus::Active {
            return Ok(FrameVerdict::from(&session));
        }

        let signals = self.analyzer.analyze(frame).await?;
        let observation = self.observe(&signals);
        self.machine
            .process(&mut session, &mut counters, &observation)
            .await
    }

    /// Evaluate signals that were already extracted from a frame
    pub async fn apply_signals(
        &self,
        session_id: Uuid,
        signals: &FrameSignals,
    ) -> Result<FrameVerdict, ProctorError> {
        let (mut session, mut counters) = match self.lock_session(session_id).await? {
            Held::Live { session, counters } => (session, counters),
            Held::Terminal(session) => return Ok(FrameVerdict::from(&session)),
        };

        let observation = self.observe(signals);
        self.machine
            .process(&mut session, &mut counters, &observation)
            .await
    }

    /// Match the single face of a frame against the gallery
    fn observe(&self, signals: &FrameSignals) -> FrameObservation {
        let identity = if signals.face_count() == 1 {
            signals.embedding.clone().and_then(|embedding| {
                let query = UnitEmbedding::normalize(embedding)
                    .map_err(|e| warn!(error = %e, "embedding unusable"))
                    .ok()?;
                self.gallery()
                    .best_match(&query)
                    .map_err(|e| warn!(error = %e, "embedding not comparable with gallery"))
                    .ok()
            })
        } else {
            None
        };

        FrameObservation {
            face_count: signals.face_count(),
            identity,
            pose: signals.pose,
        }
    }

    /// Label every face of a frame with its best gallery match
    pub fn recognize_faces(&self, faces: &[FaceSample]) -> Vec<FaceRecognition> {
        let gallery = self.gallery();
        faces
            .iter()
            .map(|face| {
                let best_match = face.embedding.clone().and_then(|embedding| {
                    let query = UnitEmbedding::normalize(embedding)
                        .map_err(|e| warn!(error = %e, "embedding unusable"))
                        .ok()?;
                    gallery
                        .best_match(&query)
                        .map_err(|e| warn!(error = %e, "embedding not comparable with gallery"))
                        .ok()
                });
                let recognized = best_match.as_ref().is_some_and(|m| {
                    m.identity.is_some() && m.similarity >= self.config.acceptance_threshold
                });
                FaceRecognition {
                    bbox: face.bbox,
                    best_match,
                    recognized,
                }
            })
            .collect()
    }

    /// Administrative unlock of a locked session
    pub async fn unlock(&self, session_id: Uuid) -> Result<SessionRecord, ProctorError> {
        let (mut session, mut guard) = self.lock_session(session_id).await?.into_parts();
        let mut idle = SessionCounters::default();
        let counters = guard.as_deref_mut().unwrap_or(&mut idle);
        self.machine.unlock(&mut session, counters).await?;
        Ok(session)
    }

    /// Complete a session
    pub async fn end_session(&self, session_id: Uuid) -> Result<SessionRecord, ProctorError> {
        let (mut session, guard) = self.lock_session(session_id).await?.into_parts();
        self.machine.end(&mut session).await?;
        if guard.is_some() {
            self.release_slot(session_id);
        }
        Ok(session)
    }

    /// Terminate a session administratively
    pub async fn abort_session(
        &self,
        session_id: Uuid,
        reason: &str,
    ) -> Result<SessionRecord, ProctorError> {
        let (mut session, guard) = self.lock_session(session_id).await?.into_parts();
        self.machine.abort(&mut session, reason).await?;
        if guard.is_some() {
            self.release_slot(session_id);
        }
        Ok(session)
    }

    pub async fn get_status(&self, session_id: Uuid) -> Result<SessionRecord, ProctorError> {
        self.load_session(session_id).await
    }

    /// Full incident history of a session
    pub async fn session_incidents(&self, session_id: Uuid) -> Result<Vec<Incident>, ProctorError> {
        self.load_session(session_id).await?;
        Ok(self.ledger.history(session_id).await?)
    }

    pub async fn incident_summary(
        &self,
        session_id: Uuid,
    ) -> Result<IncidentSummary, ProctorError> {
        self.load_session(session_id).await?;
        Ok(self.ledger.summary(session_id, SUMMARY_LATEST).await?)
    }

    /// Session-local counters, for inspection
    pub async fn counters(&self, session_id: Uuid) -> SessionCounters {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .cloned();
        match slot {
            Some(slot) => *slot.lock().await,
            None => SessionCounters::default(),
        }
    }
}
