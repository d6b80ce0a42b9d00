//! Proctoring state machine
//!
//! Per-frame transition function plus the administrative transitions
//! (unlock, end, abort). Every transition is computed on copies of the
//! session row and counters and committed only after the incident and the
//! session row have been persisted.

use std::fmt;
use std::sync::Arc;

use face_analysis::PoseEstimate;
use face_auth::{IdentityId, MatchResult};
use metrics::counter;
use serde::{Deserialize, Serialize};
use storage::{IncidentKind, IncidentLedger, ProctorStore, SessionRecord, SessionStatus};
use tracing::{debug, info};

use crate::{ProctorConfig, ProctorError};

/// Why a session was locked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    NoFace,
    MultipleFaces,
    FaceNotClear,
    FaceMismatch,
    LookingAwayRepeated,
}

impl LockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockReason::NoFace => "no face detected",
            LockReason::MultipleFaces => "multiple faces detected",
            LockReason::FaceNotClear => "face not clear",
            LockReason::FaceMismatch => "face mismatch",
            LockReason::LookingAwayRepeated => "looking away (repeated)",
        }
    }
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session-local noise counters, never persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    /// Consecutive frames without a face
    pub no_face: u32,
    /// Consecutive frames with more than one face
    pub multiple_faces: u32,
}

impl SessionCounters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What the collaborators and matcher saw in one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameObservation {
    pub face_count: usize,
    /// Best gallery match for the single face, `None` if no embedding could
    /// be obtained
    pub identity: Option<MatchResult>,
    /// `None` when pose was undeterminable
    pub pose: Option<PoseEstimate>,
}

/// Status returned for every frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameVerdict {
    pub status: SessionStatus,
    pub lock_reason: Option<String>,
}

impl From<&SessionRecord> for FrameVerdict {
    fn from(session: &SessionRecord) -> Self {
        Self {
            status: session.status,
            lock_reason: session.lock_reason.clone(),
        }
    }
}

/// Result of the identity checks on a frame
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// No face, still within the grace window
    Hold,
    Lock {
        reason: LockReason,
        incident: IncidentKind,
        details: Option<String>,
    },
    /// Identity checks passed; `deviated` carries the pose if gaze is off
    Compliant { deviated: Option<PoseEstimate> },
}

/// Drives session transitions and records them in the ledger
pub struct SessionMachine {
    config: ProctorConfig,
    store: Arc<dyn ProctorStore>,
    ledger: IncidentLedger,
}

impl SessionMachine {
    pub fn new(config: ProctorConfig, store: Arc<dyn ProctorStore>, ledger: IncidentLedger) -> Self {
        Self {
            config,
            store,
            ledger,
        }
    }

    pub fn config(&self) -> &ProctorConfig {
        &self.config
    }

    /// Identity checks in priority order; the first that applies wins
    pub fn evaluate(
        &self,
        counters: &mut SessionCounters,
        expected: &IdentityId,
        observation: &FrameObservation,
    ) -> Step {
        match observation.face_count {
            0 => {
                counters.no_face += 1;
                if counters.no_face > self.config.no_face_grace_frames {
                    counters.no_face = 0;
                    return Step::Lock {
                        reason: LockReason::NoFace,
                        incident: IncidentKind::NoFace,
                        details: None,
                    };
                }
                return Step::Hold;
            }
            1 => {}
            _ => {
                counters.no_face = 0;
                counters.multiple_faces += 1;
                return Step::Lock {
                    reason: LockReason::MultipleFaces,
                    incident: IncidentKind::MultipleFaces,
                    details: None,
                };
            }
        }

        counters.no_face = 0;
        let Some(result) = &observation.identity else {
            return Step::Lock {
                reason: LockReason::FaceNotClear,
                incident: IncidentKind::NoFace,
                details: Some("unclear".to_string()),
            };
        };

        if !result.accepts(expected, self.config.acceptance_threshold) {
            return Step::Lock {
                reason: LockReason::FaceMismatch,
                incident: IncidentKind::FaceMismatch,
                details: Some(format!("sim={:.3}", result.similarity)),
            };
        }

        counters.reset();
        Step::Compliant {
            deviated: observation
                .pose
                .filter(|pose| self.config.gaze.is_deviated(pose)),
        }
    }

    /// Apply one frame to an `Active` session.
    ///
    /// Sessions in any other status are returned verbatim. On error neither
    /// `session` nor `counters` is modified.
    pub async fn process(
        &self,
        session: &mut SessionRecord,
        counters: &mut SessionCounters,
        observation: &FrameObservation,
    ) -> Result<FrameVerdict, ProctorError> {
        if session.status != SessionStatus::Active {
            return Ok(FrameVerdict::from(&*session));
        }
        counter!("proctor_frames_evaluated_total").increment(1);

        let mut next_counters = *counters;
        let step = self.evaluate(&mut next_counters, &session.identity_id, observation);
        debug!(session_id = %session.session_id, ?step, "frame evaluated");

        match step {
            Step::Hold => {}
            Step::Lock {
                reason,
                incident,
                details,
            } => {
                self.ledger
                    .append(session.session_id, incident, details.as_deref())
                    .await?;
                self.lock(session, reason).await?;
            }
            Step::Compliant { deviated: None } => {}
            Step::Compliant {
                deviated: Some(pose),
            } => {
                let details = format!("yaw={:.1},pitch={:.1}", pose.yaw, pose.pitch);
                self.ledger
                    .append(session.session_id, IncidentKind::LookingAway, Some(&details))
                    .await?;

                let hits = self
                    .ledger
                    .count_within_window(
                        session.session_id,
                        IncidentKind::LookingAway,
                        self.config.look_away_window(),
                        self.ledger.now(),
                    )
                    .await?;
                debug!(session_id = %session.session_id, hits, "looking away");

                if hits >= self.config.look_away_min_hits {
                    self.lock(session, LockReason::LookingAwayRepeated).await?;
                }
            }
        }

        *counters = next_counters;
        Ok(FrameVerdict::from(&*session))
    }

    async fn lock(&self, session: &mut SessionRecord, reason: LockReason) -> Result<(), ProctorError> {
        let mut next = session.clone();
        next.status = SessionStatus::Locked;
        next.lock_reason = Some(reason.as_str().to_string());
        self.store.update_session(&next).await?;

        counter!("proctor_session_locks_total", "reason" => reason.as_str()).increment(1);
        info!(session_id = %session.session_id, reason = %reason, "session locked");
        *session = next;
        Ok(())
    }

    /// Return a locked session to `Active`. Unlocking an active session
    /// changes nothing.
    pub async fn unlock(
        &self,
        session: &mut SessionRecord,
        counters: &mut SessionCounters,
    ) -> Result<(), ProctorError> {
        match session.status {
            SessionStatus::Active => return Ok(()),
            SessionStatus::Locked => {}
            status => {
                return Err(ProctorError::InvalidTransition {
                    session_id: session.session_id,
                    status,
                    action: "unlock",
                })
            }
        }

        let mut next = session.clone();
        next.status = SessionStatus::Active;
        next.lock_reason = None;

        self.ledger
            .append(session.session_id, IncidentKind::ManualUnlock, None)
            .await?;
        self.store.update_session(&next).await?;

        info!(session_id = %session.session_id, "session unlocked");
        *session = next;
        counters.reset();
        Ok(())
    }

    /// Finish a session normally
    pub async fn end(&self, session: &mut SessionRecord) -> Result<(), ProctorError> {
        self.finish(session, SessionStatus::Completed, "end", None).await
    }

    /// Terminate a session administratively
    pub async fn abort(&self, session: &mut SessionRecord, reason: &str) -> Result<(), ProctorError> {
        self.finish(session, SessionStatus::Aborted, "abort", Some(reason))
            .await
    }

    async fn finish(
        &self,
        session: &mut SessionRecord,
        status: SessionStatus,
        action: &'static str,
        abort_reason: Option<&str>,
    ) -> Result<(), ProctorError> {
        if session.status.is_terminal() {
            return Err(ProctorError::InvalidTransition {
                session_id: session.session_id,
                status: session.status,
                action,
            });
        }

        let mut next = session.clone();
        next.status = status;
        next.ended_at = Some(self.ledger.now().max(session.started_at));

        if let Some(reason) = abort_reason {
            self.ledger
                .append(session.session_id, IncidentKind::SessionAborted, Some(reason))
                .await?;
        }
        self.store.update_session(&next).await?;

        info!(session_id = %session.session_id, status = %status, "session finished");
        *session = next;
        Ok(())
    }
}
