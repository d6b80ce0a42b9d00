//! Proctoring Engine
//!
//! Converts per-frame face signals into lock/unlock decisions:
//! - Session state machine (`Active`, `Locked`, `Completed`, `Aborted`)
//! - Incident logging with windowed repetition checks
//! - Identity verification, enrollment and attendance
//! - Per-session mutual exclusion for concurrent callers

pub mod config;
pub mod error;
pub mod machine;
pub mod service;

pub use config::ProctorConfig;
pub use error::{ErrorCategory, ProctorError};
pub use machine::{
    FrameObservation, FrameVerdict, LockReason, SessionCounters, SessionMachine, Step,
};
pub use service::{FaceRecognition, ProctorService, SessionStart};
