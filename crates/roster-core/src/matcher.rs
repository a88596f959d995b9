//! Identity matching: best cosine similarity over the enrolled gallery.

use crate::types::{Embedding, EmbeddingError, Identity};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("threshold must lie strictly between 0 and 1, got {0}")]
    InvalidThreshold(f64),
    #[error("invalid probe embedding: {0}")]
    InvalidEmbedding(#[from] EmbeddingError),
}

/// Minimum similarity a candidate must strictly exceed, in the open interval (0, 1).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Threshold(f64);

impl Threshold {
    pub fn new(value: f64) -> Result<Self, MatchError> {
        if value > 0.0 && value < 1.0 {
            Ok(Self(value))
        } else {
            Err(MatchError::InvalidThreshold(value))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Strict `>`: a similarity equal to the threshold is rejected.
    pub fn accepts(self, similarity: f64) -> bool {
        similarity > self.0
    }
}

/// The identity a probe resolved to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub identity_id: String,
    pub display_name: String,
    pub similarity: f64,
}

/// Outcome of matching a probe embedding against a gallery.
///
/// `NoMatch` is a valid negative answer, not a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MatchResult {
    Match(Candidate),
    NoMatch {
        /// Best similarity observed, `None` for an empty gallery.
        best_similarity: Option<f64>,
    },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match(_))
    }

    pub fn candidate(&self) -> Option<&Candidate> {
        match self {
            Self::Match(c) => Some(c),
            Self::NoMatch { .. } => None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled identities.
///
/// Linear scan today; an indexed nearest-neighbour implementation can sit behind
/// the same trait.
pub trait Matcher: Send + Sync {
    fn find(
        &self,
        probe: &Embedding,
        gallery: &[Identity],
        threshold: Threshold,
    ) -> Result<MatchResult, MatchError>;
}

/// Exhaustive cosine similarity matcher.
///
/// Always iterates ALL gallery entries. Highest similarity wins; on an exact tie
/// the lexicographically lowest identity id wins, independent of gallery order.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn find(
        &self,
        probe: &Embedding,
        gallery: &[Identity],
        threshold: Threshold,
    ) -> Result<MatchResult, MatchError> {
        probe.validate()?;

        let Some(first) = gallery.first() else {
            return Ok(MatchResult::NoMatch {
                best_similarity: None,
            });
        };

        // All gallery entries share one dimensionality; check before any arithmetic.
        let expected = first.embedding.dim();
        if probe.dim() != expected {
            return Err(MatchError::DimensionMismatch {
                expected,
                got: probe.dim(),
            });
        }

        let mut best: Option<(&Identity, f64)> = None;
        for identity in gallery {
            if identity.embedding.dim() != expected {
                return Err(MatchError::DimensionMismatch {
                    expected,
                    got: identity.embedding.dim(),
                });
            }
            let sim = probe.similarity(&identity.embedding);
            let is_better = match best {
                None => true,
                Some((prev, prev_sim)) => {
                    sim > prev_sim || (sim == prev_sim && identity.id < prev.id)
                }
            };
            if is_better {
                best = Some((identity, sim));
            }
        }

        let result = match best {
            Some((identity, sim)) if threshold.accepts(sim) => MatchResult::Match(Candidate {
                identity_id: identity.id.clone(),
                display_name: identity.display_name.clone(),
                similarity: sim,
            }),
            Some((_, sim)) => MatchResult::NoMatch {
                best_similarity: Some(sim),
            },
            None => MatchResult::NoMatch {
                best_similarity: None,
            },
        };

        match &result {
            MatchResult::Match(c) => tracing::debug!(
                identity = %c.identity_id,
                similarity = c.similarity,
                threshold = threshold.value(),
                gallery = gallery.len(),
                "probe matched"
            ),
            MatchResult::NoMatch { best_similarity } => tracing::debug!(
                best = ?best_similarity,
                threshold = threshold.value(),
                gallery = gallery.len(),
                "probe matched nobody"
            ),
        }

        Ok(result)
    }
}
