//! Face Authentication Module
//!
//! Identity matching over a gallery of enrolled face templates:
//! - Raw and unit-length embedding types
//! - Gallery of (identity, template) pairs, normalized at load time
//! - Nearest-neighbour matching by cosine similarity
//! - Verification and identification verdicts

pub mod matcher;

pub use matcher::{Gallery, GalleryEntry, Identification, MatchResult, UnitEmbedding, Verdict};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Matching error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("Embedding has no components")]
    EmptyEmbedding,

    #[error("Embedding contains a non-finite component")]
    NonFinite,

    #[error("Embedding has zero norm")]
    ZeroNorm,

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Identity of an enrolled person (a student or roll number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for IdentityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Face embedding as produced by an extractor, not necessarily unit length
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Number of components
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Euclidean norm
    pub fn l2_norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}
