use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Face embedding vector as produced by the external extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f64>,
}

/// Reasons an embedding is unusable before any comparison happens.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding is empty")]
    Empty,
    #[error("embedding value at index {index} is not finite")]
    NonFinite { index: usize },
}

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Reject empty vectors and NaN/infinite components.
    pub fn validate(&self) -> Result<(), EmbeddingError> {
        if self.values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        match self.values.iter().position(|v| !v.is_finite()) {
            Some(index) => Err(EmbeddingError::NonFinite { index }),
            None => Ok(()),
        }
    }

    /// Compute cosine similarity (`1 - cosine_distance`) between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero-norm vector
    /// is similar to nothing (0.0). Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f64 {
        // Each side is divided by its largest magnitude so the sums neither
        // overflow nor underflow; cosine is scale invariant.
        let scale_a = max_abs(&self.values);
        let scale_b = max_abs(&other.values);
        if scale_a == 0.0 || scale_b == 0.0 {
            return 0.0;
        }

        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (a / scale_a, b / scale_b);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        // sqrt of the product (not product of sqrts) keeps self-comparison exactly 1.0.
        let denom = (norm_a * norm_b).sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Little-endian byte encoding used for durable storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode [`to_le_bytes`](Self::to_le_bytes) output. Returns `None` when the
    /// byte length is not a multiple of 8.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 8 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                f64::from_le_bytes(buf)
            })
            .collect();
        Some(Self { values })
    }
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |m, v| m.max(v.abs()))
}

/// Descriptive metadata stored alongside an embedding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub display_name: String,
    /// Free-form attributes such as age, gender, department.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Profile {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// An enrolled person. Immutable once enrolled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub attributes: BTreeMap<String, String>,
    pub embedding: Embedding,
    pub registered_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(id: impl Into<String>, embedding: Embedding, profile: Profile) -> Self {
        Self {
            id: id.into(),
            display_name: profile.display_name,
            attributes: profile.attributes,
            embedding,
            registered_at: Utc::now(),
        }
    }

    /// Profile half of the identity, without the embedding.
    pub fn profile(&self) -> Profile {
        Profile {
            display_name: self.display_name.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// One check-in/check-out span for an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub record_id: Uuid,
    pub identity_id: String,
    pub check_in: Option<DateTime<Utc>>,
    pub check_out: Option<DateTime<Utc>>,
}

impl AttendanceRecord {
    /// A freshly opened record: checked in at `at`, not yet checked out.
    pub fn open(identity_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            identity_id: identity_id.into(),
            check_in: Some(at),
            check_out: None,
        }
    }

    /// `check_in` set and `check_out` unset.
    pub fn is_open(&self) -> bool {
        self.check_in.is_some() && self.check_out.is_none()
    }
}

/// Requested attendance transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CheckIn,
    CheckOut,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid action {0:?}: expected \"check_in\" or \"check_out\"")]
pub struct InvalidAction(pub String);

impl FromStr for Action {
    type Err = InvalidAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check_in" => Ok(Self::CheckIn),
            "check_out" => Ok(Self::CheckOut),
            other => Err(InvalidAction(other.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CheckIn => "check_in",
            Self::CheckOut => "check_out",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f64]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[0.3, -1.7, 2.25, 0.01]);
        assert_eq!(a.similarity(&a.clone()), 1.0);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        assert!((emb(&[1.0, 0.0]).similarity(&emb(&[-1.0, 0.0])) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_cosine_similarity_scale_invariant() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[3.0, 4.0]);
        assert_eq!(a.similarity(&b), 0.6);
    }

    #[test]
    fn test_cosine_similarity_extreme_magnitudes() {
        let big = emb(&[1e80, 2e80]);
        let small = emb(&[1e-100, 3e-100]);
        let subnormal = emb(&[4e-320, 1e-320]);
        assert_eq!(big.similarity(&big.clone()), 1.0);
        assert_eq!(small.similarity(&small.clone()), 1.0);
        assert_eq!(subnormal.similarity(&subnormal.clone()), 1.0);

        let cross = big.similarity(&small);
        assert!(cross > 0.98 && cross < 1.0, "got {cross}");
        assert!((emb(&[1e300, 0.0]).similarity(&emb(&[0.0, 1e-300]))).abs() < 1e-12);
    }

    #[test]
    fn test_validate() {
        assert_eq!(emb(&[]).validate(), Err(EmbeddingError::Empty));
        assert_eq!(
            emb(&[1.0, f64::NAN]).validate(),
            Err(EmbeddingError::NonFinite { index: 1 })
        );
        assert_eq!(
            emb(&[f64::INFINITY]).validate(),
            Err(EmbeddingError::NonFinite { index: 0 })
        );
        assert!(emb(&[0.5, -0.5]).validate().is_ok());
    }

    #[test]
    fn test_le_bytes_preserves_values() {
        let a = emb(&[0.1, -2.5, 1e-300]);
        let bytes = a.to_le_bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(Embedding::from_le_bytes(&bytes), Some(a));
        assert_eq!(Embedding::from_le_bytes(&bytes[..7]), None);
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("check_in".parse::<Action>(), Ok(Action::CheckIn));
        assert_eq!("check_out".parse::<Action>(), Ok(Action::CheckOut));
        assert_eq!(
            "checkin".parse::<Action>(),
            Err(InvalidAction("checkin".to_string()))
        );
        assert_eq!(Action::CheckOut.to_string(), "check_out");
    }

    #[test]
    fn test_open_record() {
        let rec = AttendanceRecord::open("E1", Utc::now());
        assert!(rec.is_open());
        assert_eq!(rec.identity_id, "E1");
    }
}
