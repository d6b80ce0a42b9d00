//! Drop-Oldest Frame Buffer
//!
//! Bounded single-consumer buffer between a capture producer and the
//! proctoring consumer. When full, the oldest entry is evicted to admit the
//! newest one, so a producer never waits on a slow consumer.

mod buffer;

pub use buffer::{ConsumeOrder, FrameBuffer, PushOutcome, DEFAULT_CAPACITY};

use thiserror::Error;

/// Buffer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("Buffer capacity must be at least 1")]
    ZeroCapacity,
    #[error("Buffer is closed")]
    Closed,
}

/// Counters describing what happened to everything pushed so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Entries accepted by `push`
    pub total_written: u64,
    /// Entries evicted because the buffer was full
    pub evicted: u64,
    /// Entries discarded because a newer one was consumed first
    pub superseded: u64,
    /// Entries handed to the consumer
    pub consumed: u64,
}
