//! Enrolled identity storage.
//!
//! An identity's profile and embedding are always written and read together.
//! The first successful enrollment fixes the store's dimensionality.

use crate::types::{Embedding, EmbeddingError, Identity, Profile};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("identity already enrolled: {0}")]
    DuplicateIdentity(String),
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(#[from] EmbeddingError),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Immutable, id-ordered view of every enrolled identity.
pub type Snapshot = Arc<[Identity]>;

/// Durable mapping from identity id to embedding and profile.
pub trait EmbeddingStore: Send + Sync {
    /// Enroll a new identity. Never overwrites an existing one.
    fn enroll(
        &self,
        identity_id: &str,
        embedding: Embedding,
        profile: Profile,
    ) -> Result<Identity, StoreError>;

    /// Point-in-time view, ordered by identity id.
    fn snapshot(&self) -> Result<Snapshot, StoreError>;

    fn get(&self, identity_id: &str) -> Result<Identity, StoreError>;

    /// Established dimensionality, `None` while the store is empty.
    fn dimension(&self) -> Result<Option<usize>, StoreError>;
}

/// Validation shared by every store implementation, run before touching storage.
pub fn validate_enrollment(
    identity_id: &str,
    embedding: &Embedding,
    profile: &Profile,
    dimension: Option<usize>,
) -> Result<(), StoreError> {
    if identity_id.trim().is_empty() {
        return Err(StoreError::InvalidIdentity("identity id is empty".into()));
    }
    if profile.display_name.trim().is_empty() {
        return Err(StoreError::InvalidIdentity(format!(
            "{identity_id}: display name is empty"
        )));
    }
    embedding.validate()?;
    if let Some(expected) = dimension {
        if embedding.dim() != expected {
            return Err(StoreError::DimensionMismatch {
                expected,
                got: embedding.dim(),
            });
        }
    }
    Ok(())
}

#[derive(Default)]
struct MemoryInner {
    dimension: Option<usize>,
    identities: BTreeMap<String, Identity>,
}

/// In-process store. A single `RwLock` makes every enrollment all-or-nothing
/// with respect to readers.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EmbeddingStore for MemoryStore {
    fn enroll(
        &self,
        identity_id: &str,
        embedding: Embedding,
        profile: Profile,
    ) -> Result<Identity, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        validate_enrollment(identity_id, &embedding, &profile, inner.dimension)?;
        if inner.identities.contains_key(identity_id) {
            return Err(StoreError::DuplicateIdentity(identity_id.to_string()));
        }

        let dim = embedding.dim();
        let identity = Identity::new(identity_id, embedding, profile);
        if inner.dimension.is_none() {
            inner.dimension = Some(dim);
        }
        inner
            .identities
            .insert(identity.id.clone(), identity.clone());

        tracing::info!(identity = identity_id, dim, "identity enrolled");
        Ok(identity)
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.identities.values().cloned().collect())
    }

    fn get(&self, identity_id: &str) -> Result<Identity, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .identities
            .get(identity_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(identity_id.to_string()))
    }

    fn dimension(&self) -> Result<Option<usize>, StoreError> {
        Ok(self.inner.read().unwrap_or_else(|e| e.into_inner()).dimension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f64]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_enroll_and_get() {
        let store = MemoryStore::new();
        let profile = Profile::new("Ada").with_attribute("age", "36");
        let enrolled = store.enroll("ada", emb(&[1.0, 0.0]), profile).unwrap();
        assert_eq!(enrolled.display_name, "Ada");

        let fetched = store.get("ada").unwrap();
        assert_eq!(fetched, enrolled);
        assert_eq!(fetched.attributes.get("age").map(String::as_str), Some("36"));
        assert_eq!(store.dimension().unwrap(), Some(2));
    }

    #[test]
    fn test_duplicate_rejected_and_original_kept() {
        let store = MemoryStore::new();
        store.enroll("ada", emb(&[1.0, 0.0]), Profile::new("Ada")).unwrap();
        let err = store
            .enroll("ada", emb(&[0.0, 1.0]), Profile::new("Impostor"))
            .unwrap_err();
        assert_eq!(err, StoreError::DuplicateIdentity("ada".into()));
        assert_eq!(store.get("ada").unwrap().display_name, "Ada");
    }

    #[test]
    fn test_first_enrollment_fixes_dimension() {
        let store = MemoryStore::new();
        assert_eq!(store.dimension().unwrap(), None);
        store.enroll("a", emb(&[1.0, 0.0, 0.0]), Profile::new("A")).unwrap();

        let err = store.enroll("b", emb(&[1.0, 0.0]), Profile::new("B")).unwrap_err();
        assert_eq!(err, StoreError::DimensionMismatch { expected: 3, got: 2 });
        let err = store
            .enroll("c", emb(&[1.0, 0.0, 0.0, 0.0]), Profile::new("C"))
            .unwrap_err();
        assert_eq!(err, StoreError::DimensionMismatch { expected: 3, got: 4 });
        assert_eq!(store.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_input_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.enroll(" ", emb(&[1.0]), Profile::new("A")),
            Err(StoreError::InvalidIdentity(_))
        ));
        assert!(matches!(
            store.enroll("a", emb(&[1.0]), Profile::new("")),
            Err(StoreError::InvalidIdentity(_))
        ));
        assert_eq!(
            store.enroll("a", emb(&[]), Profile::new("A")),
            Err(StoreError::InvalidEmbedding(EmbeddingError::Empty))
        );
        // Nothing was enrolled, so no dimension was fixed.
        assert_eq!(store.dimension().unwrap(), None);
    }

    #[test]
    fn test_get_missing() {
        let store = MemoryStore::new();
        assert_eq!(store.get("ghost"), Err(StoreError::NotFound("ghost".into())));
    }

    #[test]
    fn test_snapshot_ordered_and_isolated() {
        let store = MemoryStore::new();
        for id in ["c", "a", "b"] {
            store.enroll(id, emb(&[1.0, 2.0]), Profile::new(id)).unwrap();
        }
        let before = store.snapshot().unwrap();
        let ids: Vec<&str> = before.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);

        store.enroll("d", emb(&[2.0, 1.0]), Profile::new("d")).unwrap();
        assert_eq!(before.len(), 3);
        assert_eq!(store.snapshot().unwrap().len(), 4);
    }

    #[test]
    fn test_concurrent_enrollment_fully_visible() {
        let store = MemoryStore::new();
        std::thread::scope(|s| {
            for t in 0..4 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..25 {
                        let id = format!("t{t}-{i:02}");
                        store
                            .enroll(&id, emb(&[t as f64 + 1.0, i as f64]), Profile::new(&id))
                            .unwrap();
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..50 {
                    for identity in store.snapshot().unwrap().iter() {
                        assert_eq!(identity.embedding.dim(), 2);
                        assert_eq!(identity.display_name, identity.id);
                    }
                }
            });
        });
        assert_eq!(store.snapshot().unwrap().len(), 100);
    }
}
