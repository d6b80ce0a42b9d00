//! End-to-end session scenarios through `ProctorService`, driven by a
//! scripted collaborator backend and a manual clock.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use camera_capture::VideoFrame;
use chrono::{TimeZone, Utc};
use face_analysis::{Backends, BoundingBox, FaceAnalyzer, FaceSample, ScriptedBackend, ScriptedFrame};
use face_auth::{Identification, IdentityId, Verdict};
use proctor::{ErrorCategory, FrameVerdict, ProctorConfig, ProctorError, ProctorService, SessionStart};
use storage::{InMemoryStore, IncidentKind, ManualClock, ProctorStore, SessionStatus};
use uuid::Uuid;

const ALICE: [f32; 4] = [1.0, 0.0, 0.0, 0.0];
const BOB: [f32; 4] = [0.0, 1.0, 0.0, 0.0];

/// Sequence numbers at or above this are reserved for monitoring frames
const MONITOR_BASE: u64 = 1_000;

struct Harness {
    service: Arc<ProctorService>,
    clock: Arc<ManualClock>,
    store: Arc<InMemoryStore>,
}

fn png() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(8, 8, image::Rgb([120, 120, 120]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Byte-decoded frames get sequences 0, 1, 2, ... in call order. Frame 1 is
/// Bob's enrollment image; every other unscripted frame shows Alice.
fn backend() -> ScriptedBackend {
    ScriptedBackend::new(ScriptedFrame::face(ALICE.to_vec())).with_frame(1, ScriptedFrame::face(BOB.to_vec()))
}

async fn harness_with(backend: ScriptedBackend, config: ProctorConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 9, 1, 9, 0, 0).unwrap(),
    ));
    let store = Arc::new(InMemoryStore::new());
    let analyzer = FaceAnalyzer::new(
        Backends::uniform(Arc::new(backend)),
        config.collaborator_deadline(),
    );
    let service = ProctorService::new(config, store.clone(), clock.clone(), analyzer)
        .await
        .unwrap();
    Harness {
        service: Arc::new(service),
        clock,
        store,
    }
}

/// Harness with Alice and Bob enrolled and an active session for Alice
async fn started(backend: ScriptedBackend) -> (Harness, Uuid) {
    let h = harness_with(backend, ProctorConfig::default()).await;
    h.service
        .enroll_identity(IdentityId::from("alice"), "Alice", &png())
        .await
        .unwrap();
    h.service
        .enroll_identity(IdentityId::from("bob"), "Bob", &png())
        .await
        .unwrap();

    let start = h
        .service
        .start_session("CS-101", &IdentityId::from("alice"), &png())
        .await
        .unwrap();
    let session_id = match start {
        SessionStart::Started { session, .. } => session.session_id,
        other => panic!("session did not start: {other:?}"),
    };
    (h, session_id)
}

fn frame(sequence: u64) -> Arc<VideoFrame> {
    Arc::new(VideoFrame::filled(16, 16, [120, 120, 120], sequence))
}

async fn send(h: &Harness, session_id: Uuid, sequence: u64) -> FrameVerdict {
    h.service
        .process_decoded(session_id, frame(sequence))
        .await
        .unwrap()
}

async fn kinds(h: &Harness, session_id: Uuid) -> Vec<IncidentKind> {
    h.service
        .session_incidents(session_id)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.kind)
        .collect()
}

#[tokio::test]
async fn multiple_faces_lock_on_first_occurrence() {
    let (h, session_id) = started(
        backend()
            .with_frame(MONITOR_BASE, ScriptedFrame::faces(2))
            .with_frame(MONITOR_BASE + 1, ScriptedFrame::faces(2))
            .with_frame(MONITOR_BASE + 2, ScriptedFrame::faces(2)),
    )
    .await;

    let verdict = send(&h, session_id, MONITOR_BASE).await;
    assert_eq!(verdict.status, SessionStatus::Locked);
    assert_eq!(verdict.lock_reason.as_deref(), Some("multiple faces detected"));

    // Further frames are rejected at the boundary without new incidents
    send(&h, session_id, MONITOR_BASE + 1).await;
    send(&h, session_id, MONITOR_BASE + 2).await;
    assert_eq!(kinds(&h, session_id).await, vec![IncidentKind::MultipleFaces]);
}

#[tokio::test]
async fn no_face_grace_window() {
    let mut script = backend();
    for i in 0..11 {
        script = script.with_frame(MONITOR_BASE + i, ScriptedFrame::no_face());
    }
    let (h, session_id) = started(script).await;

    for i in 0..10 {
        let verdict = send(&h, session_id, MONITOR_BASE + i).await;
        assert_eq!(verdict.status, SessionStatus::Active, "frame {}", i + 1);
    }
    assert!(kinds(&h, session_id).await.is_empty());

    let verdict = send(&h, session_id, MONITOR_BASE + 10).await;
    assert_eq!(verdict.status, SessionStatus::Locked);
    assert_eq!(verdict.lock_reason.as_deref(), Some("no face detected"));
    assert_eq!(kinds(&h, session_id).await, vec![IncidentKind::NoFace]);
}

#[tokio::test]
async fn compliant_frame_resets_no_face_run() {
    let mut script = backend();
    for i in 0..10 {
        script = script.with_frame(MONITOR_BASE + i, ScriptedFrame::no_face());
    }
    for i in 11..21 {
        script = script.with_frame(MONITOR_BASE + i, ScriptedFrame::no_face());
    }
    let (h, session_id) = started(script).await;

    for i in 0..21 {
        let verdict = send(&h, session_id, MONITOR_BASE + i).await;
        assert_eq!(verdict.status, SessionStatus::Active);
    }
}

#[tokio::test]
async fn repeated_gaze_within_window_locks() {
    let mut script = backend();
    for i in 0..3 {
        script = script.with_frame(
            MONITOR_BASE + i,
            ScriptedFrame::face(ALICE.to_vec()).with_pose(45.0, 0.0),
        );
    }
    let (h, session_id) = started(script).await;

    assert_eq!(send(&h, session_id, MONITOR_BASE).await.status, SessionStatus::Active);
    h.clock.advance(Duration::from_secs(2));
    assert_eq!(
        send(&h, session_id, MONITOR_BASE + 1).await.status,
        SessionStatus::Active
    );
    h.clock.advance(Duration::from_secs(2));

    let verdict = send(&h, session_id, MONITOR_BASE + 2).await;
    assert_eq!(verdict.status, SessionStatus::Locked);
    assert_eq!(verdict.lock_reason.as_deref(), Some("looking away (repeated)"));
    assert_eq!(
        kinds(&h, session_id).await,
        vec![IncidentKind::LookingAway; 3]
    );
}

#[tokio::test]
async fn spread_out_gaze_never_locks() {
    let mut script = backend();
    for i in 0..3 {
        script = script.with_frame(
            MONITOR_BASE + i,
            ScriptedFrame::face(ALICE.to_vec()).with_pose(0.0, -40.0),
        );
    }
    let (h, session_id) = started(script).await;

    for i in 0..3 {
        let verdict = send(&h, session_id, MONITOR_BASE + i).await;
        assert_eq!(verdict.status, SessionStatus::Active);
        h.clock.advance(Duration::from_secs(15));
    }
    assert_eq!(kinds(&h, session_id).await.len(), 3);
}

#[tokio::test]
async fn missing_pose_neither_triggers_nor_clears() {
    let (h, session_id) = started(backend()).await;
    for i in 0..5 {
        assert_eq!(
            send(&h, session_id, MONITOR_BASE + i).await.status,
            SessionStatus::Active
        );
    }
    assert!(kinds(&h, session_id).await.is_empty());
}

#[tokio::test]
async fn unlock_resets_counters_and_keeps_history() {
    let (h, session_id) = started(
        backend()
            .with_frame(MONITOR_BASE, ScriptedFrame::no_face())
            .with_frame(MONITOR_BASE + 1, ScriptedFrame::faces(2)),
    )
    .await;

    send(&h, session_id, MONITOR_BASE).await;
    assert_eq!(h.service.counters(session_id).await.no_face, 1);
    send(&h, session_id, MONITOR_BASE + 1).await;

    let session = h.service.unlock(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.lock_reason, None);

    let verdict = send(&h, session_id, MONITOR_BASE + 2).await;
    assert_eq!(verdict.status, SessionStatus::Active);
    let counters = h.service.counters(session_id).await;
    assert_eq!(counters.no_face, 0);
    assert_eq!(counters.multiple_faces, 0);

    assert_eq!(
        kinds(&h, session_id).await,
        vec![IncidentKind::MultipleFaces, IncidentKind::ManualUnlock]
    );
}

#[tokio::test]
async fn unlock_active_session_is_noop() {
    let (h, session_id) = started(backend()).await;
    let session = h.service.unlock(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert!(kinds(&h, session_id).await.is_empty());
}

#[tokio::test]
async fn mismatch_and_unclear_faces_lock() {
    let (h, session_id) = started(
        backend().with_frame(MONITOR_BASE, ScriptedFrame::face(BOB.to_vec())),
    )
    .await;
    let verdict = send(&h, session_id, MONITOR_BASE).await;
    assert_eq!(verdict.lock_reason.as_deref(), Some("face mismatch"));

    let incidents = h.service.session_incidents(session_id).await.unwrap();
    assert_eq!(incidents[0].kind, IncidentKind::FaceMismatch);
    // Bob matches Bob perfectly, so the recorded score is 1.0
    assert_eq!(incidents[0].details.as_deref(), Some("sim=1.000"));

    let (h, session_id) = started(
        backend().with_frame(MONITOR_BASE, ScriptedFrame::faces(1)),
    )
    .await;
    let verdict = send(&h, session_id, MONITOR_BASE).await;
    assert_eq!(verdict.lock_reason.as_deref(), Some("face not clear"));
    let incidents = h.service.session_incidents(session_id).await.unwrap();
    assert_eq!(incidents[0].kind, IncidentKind::NoFace);
    assert_eq!(incidents[0].details.as_deref(), Some("unclear"));
}

#[tokio::test]
async fn terminal_sessions_ignore_frames() {
    let (h, completed) = started(backend().with_frame(MONITOR_BASE, ScriptedFrame::faces(3))).await;
    h.service.end_session(completed).await.unwrap();
    let verdict = send(&h, completed, MONITOR_BASE).await;
    assert_eq!(verdict.status, SessionStatus::Completed);
    assert!(kinds(&h, completed).await.is_empty());

    let (h, aborted) = started(backend().with_frame(MONITOR_BASE, ScriptedFrame::faces(3))).await;
    h.service
        .abort_session(aborted, "exam cancelled")
        .await
        .unwrap();
    let verdict = send(&h, aborted, MONITOR_BASE).await;
    assert_eq!(verdict.status, SessionStatus::Aborted);
    assert_eq!(kinds(&h, aborted).await, vec![IncidentKind::SessionAborted]);

    assert!(matches!(
        h.service.unlock(aborted).await,
        Err(ProctorError::InvalidTransition { .. })
    ));
    assert!(matches!(
        h.service.end_session(aborted).await,
        Err(ProctorError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn unknown_sessions_leave_no_lock_slots() {
    let (h, _) = started(backend()).await;

    for i in 0..50 {
        let err = h
            .service
            .process_decoded(Uuid::new_v4(), frame(MONITOR_BASE + i))
            .await
            .unwrap_err();
        assert!(matches!(err, ProctorError::UnknownSession(_)));
        assert_eq!(err.category(), ErrorCategory::Input);
    }
    let stranger = Uuid::new_v4();
    assert!(h.service.apply_signals(stranger, &Default::default()).await.is_err());
    assert!(h.service.unlock(stranger).await.is_err());
    assert!(h.service.end_session(stranger).await.is_err());
    assert!(h.service.abort_session(stranger, "gone").await.is_err());

    assert_eq!(h.service.tracked_sessions(), 0);
}

#[tokio::test]
async fn ended_session_slot_is_not_recreated() {
    let (h, session_id) = started(backend()).await;
    send(&h, session_id, MONITOR_BASE).await;
    assert_eq!(h.service.tracked_sessions(), 1);

    h.service.end_session(session_id).await.unwrap();
    assert_eq!(h.service.tracked_sessions(), 0);

    let verdict = send(&h, session_id, MONITOR_BASE + 1).await;
    assert_eq!(verdict.status, SessionStatus::Completed);
    assert!(h.service.apply_signals(session_id, &Default::default()).await.is_ok());
    assert!(h.service.unlock(session_id).await.is_err());
    assert_eq!(h.service.counters(session_id).await.no_face, 0);
    assert_eq!(h.service.tracked_sessions(), 0);
}

#[tokio::test]
async fn end_racing_frames_leaves_no_slot() {
    let mut script = backend();
    for i in 0..16 {
        script = script.with_frame(MONITOR_BASE + i, ScriptedFrame::no_face());
    }
    let (h, session_id) = started(script).await;

    let frames: Vec<_> = (0..16)
        .map(|i| {
            let service = h.service.clone();
            tokio::spawn(async move {
                service
                    .process_decoded(session_id, frame(MONITOR_BASE + i))
                    .await
            })
        })
        .collect();
    h.service.end_session(session_id).await.unwrap();
    for handle in frames {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(
        h.service.get_status(session_id).await.unwrap().status,
        SessionStatus::Completed
    );
    assert_eq!(h.service.tracked_sessions(), 0);
}

#[tokio::test]
async fn end_then_status_round_trip() {
    let (h, session_id) = started(backend()).await;
    h.clock.advance(Duration::from_secs(3600));
    h.service.end_session(session_id).await.unwrap();

    let session = h.service.get_status(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    let ended_at = session.ended_at.expect("ended_at stamped");
    assert!(ended_at >= session.started_at);
}

#[tokio::test]
async fn locked_session_can_end() {
    let (h, session_id) = started(backend().with_frame(MONITOR_BASE, ScriptedFrame::faces(2))).await;
    send(&h, session_id, MONITOR_BASE).await;
    let session = h.service.end_session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
}

#[tokio::test]
async fn start_session_rejects_impostor() {
    let h = harness_with(backend(), ProctorConfig::default()).await;

    assert!(matches!(
        h.service
            .start_session("CS-101", &IdentityId::from("alice"), &png())
            .await,
        Err(ProctorError::EmptyGallery)
    ));

    h.service
        .enroll_identity(IdentityId::from("alice"), "Alice", &png())
        .await
        .unwrap();
    h.service
        .enroll_identity(IdentityId::from("bob"), "Bob", &png())
        .await
        .unwrap();

    // Sequence 2 shows Alice, so claiming to be Bob fails
    let start = h
        .service
        .start_session("CS-101", &IdentityId::from("bob"), &png())
        .await
        .unwrap();
    assert!(matches!(start, SessionStart::Rejected { threshold, .. } if threshold == 0.5));

    let err = h
        .service
        .start_session("CS-101", &IdentityId::from("carol"), &png())
        .await
        .unwrap_err();
    assert!(matches!(err, ProctorError::UnknownIdentity(_)));
    assert_eq!(err.category(), ErrorCategory::Input);
}

#[tokio::test]
async fn verify_identity_and_invalid_image() {
    let (h, _) = started(backend()).await;
    let verdict = h
        .service
        .verify_identity(&IdentityId::from("alice"), &png())
        .await
        .unwrap();
    assert!(matches!(verdict, Verdict::Accept { similarity } if similarity > 0.99));

    assert!(matches!(
        h.service
            .verify_identity(&IdentityId::from("alice"), b"not an image")
            .await,
        Err(ProctorError::InvalidImage(_))
    ));
    assert!(matches!(
        h.service.process_frame(Uuid::new_v4(), &png()).await,
        Err(ProctorError::UnknownSession(_))
    ));
}

#[tokio::test]
async fn duplicate_and_faceless_enrollment() {
    let h = harness_with(
        ScriptedBackend::new(ScriptedFrame::face(ALICE.to_vec()))
            .with_frame(1, ScriptedFrame::no_face()),
        ProctorConfig::default(),
    )
    .await;
    h.service
        .enroll_identity(IdentityId::from("alice"), "Alice", &png())
        .await
        .unwrap();

    // Rejected before the image is decoded, so no sequence is consumed
    assert!(matches!(
        h.service
            .enroll_identity(IdentityId::from("alice"), "Alice again", &png())
            .await,
        Err(ProctorError::DuplicateIdentity(_))
    ));
    assert!(matches!(
        h.service.add_template(&IdentityId::from("nobody"), &png()).await,
        Err(ProctorError::UnknownIdentity(_))
    ));

    assert!(matches!(
        h.service.add_template(&IdentityId::from("alice"), &png()).await,
        Err(ProctorError::NoFaceDetected)
    ));
    h.service
        .add_template(&IdentityId::from("alice"), &png())
        .await
        .unwrap();

    let identities = h.service.list_identities().await.unwrap();
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].template_count, 2);
    assert_eq!(h.service.gallery().len(), 2);
}

#[tokio::test]
async fn attendance_marks_only_recognized_faces() {
    let h = harness_with(
        backend().with_frame(3, ScriptedFrame::face(vec![0.0, 0.0, 1.0, 0.0])),
        ProctorConfig::default(),
    )
    .await;
    let since = Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap();

    h.service
        .enroll_identity(IdentityId::from("alice"), "Alice", &png())
        .await
        .unwrap();
    h.service
        .enroll_identity(IdentityId::from("bob"), "Bob", &png())
        .await
        .unwrap();

    let recognized = h
        .service
        .mark_attendance(&png(), Some("Algebra"), None)
        .await
        .unwrap();
    assert!(matches!(
        recognized,
        Identification::Recognized { ref identity, .. } if identity == &IdentityId::from("alice")
    ));

    // Sequence 3 is a stranger orthogonal to everyone enrolled
    let unrecognized = h
        .service
        .mark_attendance(&png(), Some("Algebra"), None)
        .await
        .unwrap();
    assert!(matches!(unrecognized, Identification::Unrecognized { .. }));

    let records = h.service.attendance_since(since).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].class_name.as_deref(), Some("Algebra"));
}

#[tokio::test]
async fn unusable_templates_are_input_errors() {
    // Decoded frames 0..=2 go to the two enrollments and the session start
    let (h, _) = started(
        backend()
            .with_frame(3, ScriptedFrame::face(vec![1.0, 0.0]))
            .with_frame(4, ScriptedFrame::face(vec![0.0; 4])),
    )
    .await;
    let alice = IdentityId::from("alice");

    let err = h.service.add_template(&alice, &png()).await.unwrap_err();
    assert!(matches!(err, ProctorError::InvalidTemplate(_)));
    assert_eq!(err.category(), ErrorCategory::Input);

    let err = h.service.add_template(&alice, &png()).await.unwrap_err();
    assert!(matches!(err, ProctorError::InvalidTemplate(_)));
    assert_eq!(err.category(), ErrorCategory::Input);

    assert_eq!(h.service.gallery().len(), 2);
}

#[tokio::test]
async fn every_face_gets_its_best_match() {
    let (h, _) = started(backend()).await;
    let bbox = |x: f32| BoundingBox {
        x,
        y: 0.0,
        width: 8.0,
        height: 8.0,
        confidence: 0.9,
    };
    let sample = |x: f32, embedding: Option<Vec<f32>>| FaceSample {
        bbox: bbox(x),
        embedding: embedding.map(face_auth::Embedding::new),
    };

    let results = h.service.recognize_faces(&[
        sample(0.0, Some(BOB.to_vec())),
        sample(8.0, Some(ALICE.to_vec())),
        sample(16.0, Some(vec![0.0, 0.0, 1.0, 0.0])),
        sample(24.0, None),
        sample(32.0, Some(vec![1.0, 0.0])),
    ]);

    assert_eq!(results.len(), 5);
    let bob = results[0].best_match.as_ref().unwrap();
    assert_eq!(bob.identity, Some(IdentityId::from("bob")));
    assert!(results[0].recognized);
    assert_eq!(results[1].best_match.as_ref().unwrap().identity, Some(IdentityId::from("alice")));
    assert!(results[1].recognized);
    assert_eq!(results[1].bbox, bbox(8.0));

    // Orthogonal to everyone enrolled
    assert!(results[2].best_match.is_some());
    assert!(!results[2].recognized);
    // No embedding, or one the gallery cannot compare
    assert_eq!(results[3].best_match, None);
    assert_eq!(results[4].best_match, None);
    assert!(!results[4].recognized);
}

#[tokio::test]
async fn detector_failure_leaves_session_untouched() {
    let (h, session_id) = started(
        backend().with_frame(MONITOR_BASE, ScriptedFrame::detector_failure()),
    )
    .await;

    let err = h
        .service
        .process_decoded(session_id, frame(MONITOR_BASE))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Collaborator);

    let session = h.service.get_status(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert!(kinds(&h, session_id).await.is_empty());
}

/// Alice enrolled with an active session, on backends that never stall
async fn alice_session(config: ProctorConfig, script: ScriptedFrame) -> (Harness, Uuid) {
    let h = harness_with(ScriptedBackend::new(script), config).await;
    h.service
        .enroll_identity(IdentityId::from("alice"), "Alice", &png())
        .await
        .unwrap();
    let start = h
        .service
        .start_session("CS-101", &IdentityId::from("alice"), &png())
        .await
        .unwrap();
    let SessionStart::Started { session, .. } = start else {
        panic!("session did not start");
    };
    (h, session.session_id)
}

/// A second service over the same store and clock with its own backends
async fn monitor_with(h: &Harness, backends: Backends, config: ProctorConfig) -> ProctorService {
    let analyzer = FaceAnalyzer::new(backends, config.collaborator_deadline());
    ProctorService::new(config, h.store.clone(), h.clock.clone(), analyzer)
        .await
        .unwrap()
}

#[tokio::test]
async fn slow_detector_is_a_collaborator_error() {
    let config = ProctorConfig {
        collaborator_deadline_ms: 50,
        ..Default::default()
    };
    let script = ScriptedFrame::face(ALICE.to_vec());
    let (h, session_id) = alice_session(config.clone(), script.clone()).await;

    // Same store, but every collaborator call now outlives the deadline
    let slow = ScriptedBackend::new(script).with_delay(Duration::from_millis(200));
    let monitor = monitor_with(&h, Backends::uniform(Arc::new(slow)), config).await;
    let err = monitor
        .process_decoded(session_id, frame(MONITOR_BASE))
        .await
        .unwrap_err();
    assert!(matches!(err, ProctorError::Analysis(_)));
    assert_eq!(
        h.service.get_status(session_id).await.unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test]
async fn slow_embedding_means_face_not_clear() {
    let config = ProctorConfig {
        collaborator_deadline_ms: 50,
        ..Default::default()
    };
    let script = ScriptedFrame::face(ALICE.to_vec());
    let (h, session_id) = alice_session(config.clone(), script.clone()).await;

    let fast = Arc::new(ScriptedBackend::new(script.clone()));
    let slow = Arc::new(ScriptedBackend::new(script).with_delay(Duration::from_millis(300)));
    let monitor = monitor_with(
        &h,
        Backends {
            detector: fast.clone(),
            extractor: slow,
            pose: fast,
        },
        config,
    )
    .await;

    let verdict = monitor
        .process_decoded(session_id, frame(MONITOR_BASE))
        .await
        .unwrap();
    assert_eq!(verdict.status, SessionStatus::Locked);
    assert_eq!(verdict.lock_reason.as_deref(), Some("face not clear"));
    let incidents = h.service.session_incidents(session_id).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].kind, IncidentKind::NoFace);
    assert_eq!(incidents[0].details.as_deref(), Some("unclear"));
}

#[tokio::test]
async fn slow_pose_is_inconclusive() {
    let config = ProctorConfig {
        collaborator_deadline_ms: 50,
        ..Default::default()
    };
    // Far enough off-axis to record a deviation if the pose arrived in time
    let script = ScriptedFrame::face(ALICE.to_vec()).with_pose(60.0, 0.0);
    let (h, session_id) = alice_session(config.clone(), script.clone()).await;

    let fast = Arc::new(ScriptedBackend::new(script.clone()));
    let slow = Arc::new(ScriptedBackend::new(script).with_delay(Duration::from_millis(300)));
    let monitor = monitor_with(
        &h,
        Backends {
            detector: fast.clone(),
            extractor: fast,
            pose: slow,
        },
        config,
    )
    .await;

    for i in 0..3 {
        let verdict = monitor
            .process_decoded(session_id, frame(MONITOR_BASE + i))
            .await
            .unwrap();
        assert_eq!(verdict.status, SessionStatus::Active);
        assert_eq!(verdict.lock_reason, None);
    }
    assert!(kinds(&h, session_id).await.is_empty());
}

#[tokio::test]
async fn storage_failure_is_not_a_transition() {
    let (h, session_id) = started(backend().with_frame(MONITOR_BASE, ScriptedFrame::faces(2))).await;

    h.store.set_unavailable(true);
    let err = h
        .service
        .process_decoded(session_id, frame(MONITOR_BASE))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Storage);
    h.store.set_unavailable(false);

    let session = h.store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.lock_reason, None);
}

#[tokio::test]
async fn concurrent_frames_on_one_session_are_serialized() {
    let mut script = backend();
    for i in 0..8 {
        script = script.with_frame(MONITOR_BASE + i, ScriptedFrame::faces(2));
    }
    let (h, session_id) = started(script).await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let service = h.service.clone();
            tokio::spawn(async move {
                service
                    .process_decoded(session_id, frame(MONITOR_BASE + i))
                    .await
            })
        })
        .collect();

    for handle in handles {
        let verdict = handle.await.unwrap().unwrap();
        assert_eq!(verdict.status, SessionStatus::Locked);
    }
    assert_eq!(kinds(&h, session_id).await, vec![IncidentKind::MultipleFaces]);
}

#[tokio::test]
async fn incident_summary_counts_by_kind() {
    let (h, session_id) = started(
        backend()
            .with_frame(MONITOR_BASE, ScriptedFrame::face(ALICE.to_vec()).with_pose(50.0, 0.0))
            .with_frame(MONITOR_BASE + 1, ScriptedFrame::faces(2)),
    )
    .await;
    send(&h, session_id, MONITOR_BASE).await;
    send(&h, session_id, MONITOR_BASE + 1).await;
    h.service.unlock(session_id).await.unwrap();

    let summary = h.service.incident_summary(session_id).await.unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.by_kind[&IncidentKind::LookingAway], 1);
    assert_eq!(summary.by_kind[&IncidentKind::MultipleFaces], 1);
    assert_eq!(summary.latest.last().map(|i| i.kind), Some(IncidentKind::ManualUnlock));
}
