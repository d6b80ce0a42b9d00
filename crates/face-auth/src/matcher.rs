//! Embedding gallery and nearest-neighbour matching

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Embedding, IdentityId, MatchError};

/// Similarity reported when the gallery is empty. Lower than any cosine
/// similarity, so every threshold comparison against it rejects.
pub const EMPTY_GALLERY_SIMILARITY: f32 = -1.0;

/// L2-normalized embedding
#[derive(Debug, Clone, PartialEq)]
pub struct UnitEmbedding(Vec<f32>);

impl UnitEmbedding {
    /// Normalize a raw embedding to unit length
    pub fn normalize(embedding: Embedding) -> Result<Self, MatchError> {
        let mut values = embedding.values;
        if values.is_empty() {
            return Err(MatchError::EmptyEmbedding);
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(MatchError::NonFinite);
        }

        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON || !norm.is_finite() {
            return Err(MatchError::ZeroNorm);
        }

        values.iter_mut().for_each(|v| *v /= norm);
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// Cosine similarity with another unit embedding
    #[inline]
    pub fn dot(&self, other: &UnitEmbedding) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a * b)
            .sum::<f32>()
            .clamp(-1.0, 1.0)
    }
}

impl TryFrom<Embedding> for UnitEmbedding {
    type Error = MatchError;

    fn try_from(embedding: Embedding) -> Result<Self, Self::Error> {
        Self::normalize(embedding)
    }
}

/// One enrolled template
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: IdentityId,
    pub embedding: UnitEmbedding,
}

/// Best match over a gallery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// `None` only for an empty gallery
    pub identity: Option<IdentityId>,
    pub similarity: f32,
}

impl MatchResult {
    /// Whether this result names `expected` with at least `threshold` similarity
    pub fn accepts(&self, expected: &IdentityId, threshold: f32) -> bool {
        self.identity.as_ref() == Some(expected) && self.similarity >= threshold
    }
}

/// Outcome of verifying a face against a claimed identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accept { similarity: f32 },
    Reject { similarity: f32, threshold: f32 },
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept { .. })
    }

    pub fn similarity(&self) -> f32 {
        match self {
            Verdict::Accept { similarity } | Verdict::Reject { similarity, .. } => *similarity,
        }
    }
}

/// Outcome of identifying a face against the whole gallery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Identification {
    Recognized {
        identity: IdentityId,
        similarity: f32,
    },
    Unrecognized {
        similarity: f32,
        threshold: f32,
    },
}

/// Ordered gallery of enrolled templates.
///
/// Iteration order is the order templates were supplied in and decides ties.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a gallery from raw templates, normalizing each one
    pub fn from_templates<I>(templates: I) -> Result<Self, MatchError>
    where
        I: IntoIterator<Item = (IdentityId, Embedding)>,
    {
        let mut gallery = Self::new();
        for (identity, embedding) in templates {
            gallery.push(identity, embedding)?;
        }
        debug!(templates = gallery.len(), "gallery loaded");
        Ok(gallery)
    }

    /// Append a template; all templates must share one dimension
    pub fn push(&mut self, identity: IdentityId, embedding: Embedding) -> Result<(), MatchError> {
        let embedding = UnitEmbedding::normalize(embedding)?;
        if let Some(expected) = self.dimension() {
            if embedding.dimension() != expected {
                return Err(MatchError::DimensionMismatch {
                    expected,
                    actual: embedding.dimension(),
                });
            }
        }
        self.entries.push(GalleryEntry {
            identity,
            embedding,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Template dimension, `None` while empty
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dimension())
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    /// Nearest template by cosine similarity.
    ///
    /// Strictly greater similarity wins, so the first-seen entry wins ties.
    /// An empty gallery yields `(None, -1.0)`.
    pub fn best_match(&self, query: &UnitEmbedding) -> Result<MatchResult, MatchError> {
        if let Some(expected) = self.dimension() {
            if query.dimension() != expected {
                return Err(MatchError::DimensionMismatch {
                    expected,
                    actual: query.dimension(),
                });
            }
        }

        let mut best: Option<&GalleryEntry> = None;
        let mut best_similarity = EMPTY_GALLERY_SIMILARITY;

        for entry in &self.entries {
            let similarity = query.dot(&entry.embedding);
            if best.is_none() || similarity > best_similarity {
                best = Some(entry);
                best_similarity = similarity;
            }
        }

        Ok(MatchResult {
            identity: best.map(|e| e.identity.clone()),
            similarity: best_similarity,
        })
    }

    /// Verify that `query` belongs to `expected`
    pub fn verify(
        &self,
        expected: &IdentityId,
        query: &UnitEmbedding,
        threshold: f32,
    ) -> Result<Verdict, MatchError> {
        let result = self.best_match(query)?;
        Ok(if result.accepts(expected, threshold) {
            Verdict::Accept {
                similarity: result.similarity,
            }
        } else {
            Verdict::Reject {
                similarity: result.similarity,
                threshold,
            }
        })
    }

    /// Identify `query` against every enrolled identity
    pub fn identify(
        &self,
        query: &UnitEmbedding,
        threshold: f32,
    ) -> Result<Identification, MatchError> {
        let result = self.best_match(query)?;
        Ok(match result.identity {
            Some(identity) if result.similarity >= threshold => Identification::Recognized {
                identity,
                similarity: result.similarity,
            },
            _ => Identification::Unrecognized {
                similarity: result.similarity,
                threshold,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unit(values: &[f32]) -> UnitEmbedding {
        UnitEmbedding::normalize(Embedding::new(values.to_vec())).unwrap()
    }

    fn gallery(entries: &[(&str, &[f32])]) -> Gallery {
        Gallery::from_templates(
            entries
                .iter()
                .map(|(id, v)| (IdentityId::from(*id), Embedding::new(v.to_vec()))),
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_rejects_degenerate_vectors() {
        assert_eq!(
            UnitEmbedding::normalize(Embedding::new(vec![])),
            Err(MatchError::EmptyEmbedding)
        );
        assert_eq!(
            UnitEmbedding::normalize(Embedding::new(vec![0.0, 0.0])),
            Err(MatchError::ZeroNorm)
        );
        assert_eq!(
            UnitEmbedding::normalize(Embedding::new(vec![1.0, f32::NAN])),
            Err(MatchError::NonFinite)
        );
    }

    #[test]
    fn test_gallery_normalizes_at_load() {
        let g = gallery(&[("a", &[10.0, 0.0])]);
        assert!((g.entries()[0].embedding.as_slice()[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_gallery_sentinel() {
        let result = Gallery::new().best_match(&unit(&[1.0, 0.0])).unwrap();
        assert_eq!(result.identity, None);
        assert_eq!(result.similarity, -1.0);
    }

    #[test]
    fn test_best_match_picks_nearest() {
        let g = gallery(&[("a", &[1.0, 0.0]), ("b", &[0.0, 1.0])]);
        let result = g.best_match(&unit(&[0.1, 0.9])).unwrap();
        assert_eq!(result.identity, Some(IdentityId::from("b")));
    }

    #[test]
    fn test_ties_go_to_first_seen() {
        let g = gallery(&[("first", &[1.0, 0.0]), ("second", &[2.0, 0.0])]);
        let result = g.best_match(&unit(&[1.0, 0.0])).unwrap();
        assert_eq!(result.identity, Some(IdentityId::from("first")));
    }

    #[test]
    fn test_below_threshold_still_reports_best() {
        let g = gallery(&[("a", &[1.0, 0.0])]);
        let result = g.best_match(&unit(&[0.0, 1.0])).unwrap();
        assert_eq!(result.identity, Some(IdentityId::from("a")));
        assert!(result.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch() {
        let g = gallery(&[("a", &[1.0, 0.0])]);
        assert_eq!(
            g.best_match(&unit(&[1.0, 0.0, 0.0])),
            Err(MatchError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        );

        let mut g = g;
        assert!(g
            .push(IdentityId::from("b"), Embedding::new(vec![1.0]))
            .is_err());
    }

    #[test]
    fn test_verify_requires_expected_identity() {
        let g = gallery(&[("alice", &[1.0, 0.0]), ("bob", &[0.0, 1.0])]);
        let query = unit(&[1.0, 0.05]);

        assert!(g
            .verify(&IdentityId::from("alice"), &query, 0.5)
            .unwrap()
            .is_accept());

        match g.verify(&IdentityId::from("bob"), &query, 0.5).unwrap() {
            Verdict::Reject {
                similarity,
                threshold,
            } => {
                assert!(similarity > 0.9);
                assert_eq!(threshold, 0.5);
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn test_verify_against_empty_gallery_rejects() {
        let verdict = Gallery::new()
            .verify(&IdentityId::from("alice"), &unit(&[1.0]), -1.0)
            .unwrap();
        assert!(!verdict.is_accept());
    }

    #[test]
    fn test_identify() {
        let g = gallery(&[("alice", &[1.0, 0.0])]);
        assert_eq!(
            g.identify(&unit(&[1.0, 0.0]), 0.5).unwrap(),
            Identification::Recognized {
                identity: IdentityId::from("alice"),
                similarity: 1.0
            }
        );
        assert!(matches!(
            g.identify(&unit(&[0.0, 1.0]), 0.5).unwrap(),
            Identification::Unrecognized { .. }
        ));
    }

    fn vector(dim: usize) -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-10.0f32..10.0, dim)
            .prop_filter("non-zero norm", |v| v.iter().map(|x| x * x).sum::<f32>() > 1e-3)
    }

    proptest! {
        #[test]
        fn prop_self_match_is_perfect(v in vector(16)) {
            let g = Gallery::from_templates([(IdentityId::from("id"), Embedding::new(v.clone()))]).unwrap();
            let result = g.best_match(&unit(&v)).unwrap();
            prop_assert_eq!(result.identity, Some(IdentityId::from("id")));
            prop_assert!((result.similarity - 1.0).abs() < 1e-5);
        }

        #[test]
        fn prop_returned_similarity_is_maximum(
            query in vector(8),
            templates in prop::collection::vec(vector(8), 1..12),
        ) {
            let g = Gallery::from_templates(
                templates.iter().enumerate().map(|(i, v)| (IdentityId::new(i.to_string()), Embedding::new(v.clone()))),
            ).unwrap();
            let q = unit(&query);
            let result = g.best_match(&q).unwrap();

            for entry in g.entries() {
                prop_assert!(q.dot(&entry.embedding) <= result.similarity);
            }
            prop_assert!((-1.0..=1.0).contains(&result.similarity));
        }

        #[test]
        fn prop_empty_gallery_always_sentinel(query in vector(4)) {
            let result = Gallery::new().best_match(&unit(&query)).unwrap();
            prop_assert_eq!(result.identity, None);
            prop_assert_eq!(result.similarity, -1.0);
        }
    }
}
