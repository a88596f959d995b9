//! Recognition and attendance orchestration behind the D-Bus interface.
//!
//! The store, attendance backend and extraction engine are injected, so the same
//! service runs over SQLite in the daemon and over in-memory stores in tests.

use crate::engine::{EngineError, EngineHandle};
use chrono::{DateTime, Utc};
use roster_core::ledger::{AttendanceBackend, AttendanceLedger, AttendanceState, LedgerError};
use roster_core::matcher::{Candidate, CosineMatcher, MatchError, MatchResult, Matcher, Threshold};
use roster_core::store::{EmbeddingStore, StoreError};
use roster_core::{Action, AttendanceRecord, Embedding, Identity, InvalidAction, Profile};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Profile attribute recording the image an identity was enrolled from.
pub const PHOTO_ATTRIBUTE: &str = "photo";

#[derive(Error, Debug)]
pub enum RosterError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    InvalidAction(#[from] InvalidAction),
    #[error("no embedding extractor configured (set ROSTER_EXTRACTOR)")]
    ExtractorUnavailable,
    #[error("embedding extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Identity without its embedding, for replies and listings.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub id: String,
    pub display_name: String,
    pub attributes: BTreeMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub dimension: usize,
}

impl From<&Identity> for IdentitySummary {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            attributes: identity.attributes.clone(),
            registered_at: identity.registered_at,
            dimension: identity.embedding.dim(),
        }
    }
}

/// Outcome of recognizing a face and logging attendance for it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CaptureOutcome {
    Logged {
        identity: Candidate,
        action: Action,
        record: AttendanceRecord,
    },
    NoMatch {
        best_similarity: Option<f64>,
    },
}

/// Attendance overview for one identity.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceReport {
    pub identity: IdentitySummary,
    pub state: AttendanceState,
    pub records: Vec<AttendanceRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub identities: usize,
    pub dimension: Option<usize>,
    pub similarity_threshold: Threshold,
    pub extractor: bool,
}

#[derive(Clone)]
pub struct Roster {
    store: Arc<dyn EmbeddingStore>,
    ledger: Arc<AttendanceLedger<Arc<dyn AttendanceBackend>>>,
    matcher: Arc<dyn Matcher>,
    threshold: Threshold,
    engine: Option<EngineHandle>,
    extract_timeout: Duration,
}

impl Roster {
    pub fn new(
        store: Arc<dyn EmbeddingStore>,
        attendance: Arc<dyn AttendanceBackend>,
        threshold: Threshold,
        engine: Option<EngineHandle>,
        extract_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger: Arc::new(AttendanceLedger::new(attendance)),
            matcher: Arc::new(CosineMatcher),
            threshold,
            engine,
            extract_timeout,
        }
    }

    /// Extract a live embedding, bounded by the configured timeout.
    async fn extract(&self, image: PathBuf) -> Result<Embedding, RosterError> {
        let engine = self.engine.as_ref().ok_or(RosterError::ExtractorUnavailable)?;
        tokio::time::timeout(self.extract_timeout, engine.extract(image))
            .await
            .map_err(|_| RosterError::Timeout(self.extract_timeout))?
            .map_err(RosterError::from)
    }

    /// Enroll from a face image. The image path is kept as the `photo` attribute.
    pub async fn enroll_image(
        &self,
        identity_id: String,
        profile: Profile,
        image: PathBuf,
    ) -> Result<IdentitySummary, RosterError> {
        let profile = profile.with_attribute(PHOTO_ATTRIBUTE, image.display().to_string());
        let embedding = self.extract(image).await?;
        self.enroll_embedding(identity_id, profile, embedding).await
    }

    pub async fn enroll_embedding(
        &self,
        identity_id: String,
        profile: Profile,
        embedding: Embedding,
    ) -> Result<IdentitySummary, RosterError> {
        let store = Arc::clone(&self.store);
        let identity =
            tokio::task::spawn_blocking(move || store.enroll(&identity_id, embedding, profile))
                .await??;
        Ok(IdentitySummary::from(&identity))
    }

    pub async fn recognize_image(&self, image: PathBuf) -> Result<MatchResult, RosterError> {
        let embedding = self.extract(image).await?;
        self.recognize(embedding).await
    }

    /// Match against the current snapshot. `NoMatch` is an `Ok` result.
    pub async fn recognize(&self, embedding: Embedding) -> Result<MatchResult, RosterError> {
        let store = Arc::clone(&self.store);
        let matcher = Arc::clone(&self.matcher);
        let threshold = self.threshold;
        let result = tokio::task::spawn_blocking(move || -> Result<MatchResult, RosterError> {
            let snapshot = store.snapshot()?;
            Ok(matcher.find(&embedding, &snapshot, threshold)?)
        })
        .await??;

        match &result {
            MatchResult::Match(c) => tracing::info!(
                identity = %c.identity_id,
                similarity = c.similarity,
                "face recognized"
            ),
            MatchResult::NoMatch { best_similarity } => {
                tracing::info!(best = ?best_similarity, "no match found")
            }
        }
        Ok(result)
    }

    /// Recognize the face in `image`, then apply `action` to whoever it is.
    pub async fn capture_attendance(
        &self,
        image: PathBuf,
        action: Action,
    ) -> Result<CaptureOutcome, RosterError> {
        let embedding = self.extract(image).await?;
        self.capture_embedding(embedding, action).await
    }

    pub async fn capture_embedding(
        &self,
        embedding: Embedding,
        action: Action,
    ) -> Result<CaptureOutcome, RosterError> {
        match self.recognize(embedding).await? {
            MatchResult::Match(identity) => {
                let record = self.transition(identity.identity_id.clone(), action).await?;
                Ok(CaptureOutcome::Logged {
                    identity,
                    action,
                    record,
                })
            }
            MatchResult::NoMatch { best_similarity } => {
                Ok(CaptureOutcome::NoMatch { best_similarity })
            }
        }
    }

    /// Apply `action` to an identity that must be enrolled.
    pub async fn log_attendance(
        &self,
        identity_id: String,
        action: Action,
    ) -> Result<AttendanceRecord, RosterError> {
        let store = Arc::clone(&self.store);
        let id = identity_id.clone();
        tokio::task::spawn_blocking(move || store.get(&id)).await??;
        self.transition(identity_id, action).await
    }

    async fn transition(
        &self,
        identity_id: String,
        action: Action,
    ) -> Result<AttendanceRecord, RosterError> {
        let ledger = Arc::clone(&self.ledger);
        let record = tokio::task::spawn_blocking(move || {
            ledger.transition(&identity_id, action, Utc::now())
        })
        .await??;
        Ok(record)
    }

    pub async fn attendance(&self, identity_id: String) -> Result<AttendanceReport, RosterError> {
        let store = Arc::clone(&self.store);
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || -> Result<AttendanceReport, RosterError> {
            let identity = store.get(&identity_id)?;
            Ok(AttendanceReport {
                identity: IdentitySummary::from(&identity),
                state: ledger.state(&identity_id)?,
                records: ledger.history(&identity_id)?,
            })
        })
        .await?
    }

    pub fn identities(&self) -> Result<Vec<IdentitySummary>, RosterError> {
        let snapshot = self.store.snapshot()?;
        Ok(snapshot.iter().map(IdentitySummary::from).collect())
    }

    pub fn status(&self) -> Result<Status, RosterError> {
        let snapshot = self.store.snapshot()?;
        Ok(Status {
            version: env!("CARGO_PKG_VERSION"),
            identities: snapshot.len(),
            dimension: snapshot.first().map(|i| i.embedding.dim()),
            similarity_threshold: self.threshold,
            extractor: self.engine.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::store::SqliteStore;
    use roster_core::extract::ExtractError;
    use roster_core::{MemoryLedger, MemoryStore};
    use std::path::Path;

    fn roster_with(engine: Option<EngineHandle>) -> Roster {
        Roster::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLedger::new()),
            Threshold::new(0.6).unwrap(),
            engine,
            Duration::from_secs(5),
        )
    }

    /// Fake extractor: the file stem picks the embedding.
    fn stem_extractor(path: &Path) -> Result<Embedding, ExtractError> {
        match path.file_stem().and_then(|s| s.to_str()) {
            Some("ada") => Ok(Embedding::new(vec![1.0, 0.0, 0.1])),
            Some("ada-again") => Ok(Embedding::new(vec![0.98, 0.02, 0.11])),
            Some("stranger") => Ok(Embedding::new(vec![0.0, 1.0, 0.0])),
            Some("wall") => Err(ExtractError::NoFaceDetected),
            Some("slow") => {
                std::thread::sleep(Duration::from_millis(500));
                Ok(Embedding::new(vec![1.0, 0.0, 0.1]))
            }
            _ => Err(ExtractError::ExtractionFailed("unreadable".into())),
        }
    }

    #[tokio::test]
    async fn test_enroll_recognize_and_capture() {
        let roster = roster_with(Some(spawn_engine(stem_extractor).unwrap()));
        let summary = roster
            .enroll_image("E1".into(), Profile::new("Ada"), "ada.jpg".into())
            .await
            .unwrap();
        assert_eq!(summary.dimension, 3);
        assert_eq!(summary.attributes[PHOTO_ATTRIBUTE], "ada.jpg");

        let result = roster.recognize_image("ada-again.jpg".into()).await.unwrap();
        assert_eq!(result.candidate().unwrap().identity_id, "E1");

        match roster
            .capture_attendance("ada-again.jpg".into(), Action::CheckIn)
            .await
            .unwrap()
        {
            CaptureOutcome::Logged { identity, record, .. } => {
                assert_eq!(identity.identity_id, "E1");
                assert!(record.is_open());
            }
            other => panic!("expected logged, got {other:?}"),
        }

        let err = roster
            .capture_attendance("ada.jpg".into(), Action::CheckIn)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RosterError::Ledger(LedgerError::AlreadyCheckedIn { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_face_differs_from_no_match() {
        let roster = roster_with(Some(spawn_engine(stem_extractor).unwrap()));
        roster
            .enroll_image("E1".into(), Profile::new("Ada"), "ada.jpg".into())
            .await
            .unwrap();

        let no_match = roster.recognize_image("stranger.jpg".into()).await.unwrap();
        assert!(!no_match.is_match());

        let no_face = roster.recognize_image("wall.jpg".into()).await.unwrap_err();
        assert!(matches!(
            no_face,
            RosterError::Engine(EngineError::Extract(ExtractError::NoFaceDetected))
        ));

        let capture = roster
            .capture_attendance("stranger.jpg".into(), Action::CheckIn)
            .await
            .unwrap();
        assert!(matches!(capture, CaptureOutcome::NoMatch { .. }));
    }

    #[tokio::test]
    async fn test_extraction_timeout() {
        let roster = Roster::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLedger::new()),
            Threshold::new(0.6).unwrap(),
            Some(spawn_engine(stem_extractor).unwrap()),
            Duration::from_millis(50),
        );
        let err = roster.recognize_image("slow.jpg".into()).await.unwrap_err();
        assert!(matches!(err, RosterError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_without_extractor() {
        let roster = roster_with(None);
        let err = roster.recognize_image("ada.jpg".into()).await.unwrap_err();
        assert!(matches!(err, RosterError::ExtractorUnavailable));
        assert!(!roster.status().unwrap().extractor);
    }

    #[tokio::test]
    async fn test_log_attendance_requires_enrollment() {
        let roster = roster_with(None);
        let err = roster
            .log_attendance("ghost".into(), Action::CheckIn)
            .await
            .unwrap_err();
        assert!(matches!(err, RosterError::Store(StoreError::NotFound(_))));

        roster
            .enroll_embedding("E1".into(), Profile::new("Ada"), Embedding::new(vec![1.0, 0.0]))
            .await
            .unwrap();
        roster.log_attendance("E1".into(), Action::CheckIn).await.unwrap();
        roster.log_attendance("E1".into(), Action::CheckOut).await.unwrap();
        let err = roster
            .log_attendance("E1".into(), Action::CheckOut)
            .await
            .unwrap_err();
        assert!(matches!(err, RosterError::Ledger(LedgerError::NotCheckedIn(_))));

        let report = roster.attendance("E1".into()).await.unwrap();
        assert_eq!(report.records.len(), 1);
        assert!(matches!(report.state, AttendanceState::CheckedOut(_)));
    }

    #[tokio::test]
    async fn test_recognize_dimension_mismatch() {
        let roster = roster_with(None);
        roster
            .enroll_embedding("E1".into(), Profile::new("Ada"), Embedding::new(vec![1.0, 0.0]))
            .await
            .unwrap();
        let err = roster
            .recognize(Embedding::new(vec![1.0, 0.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RosterError::Match(MatchError::DimensionMismatch { expected: 2, got: 3 })
        ));
    }

    #[tokio::test]
    async fn test_invalid_live_embedding_is_not_a_no_match() {
        let roster = roster_with(None);
        let err = roster
            .recognize(Embedding::new(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, RosterError::Match(MatchError::InvalidEmbedding(_))));

        roster
            .enroll_embedding("E1".into(), Profile::new("Ada"), Embedding::new(vec![1.0, 0.0]))
            .await
            .unwrap();
        let err = roster
            .capture_embedding(Embedding::new(vec![f64::NAN, 0.0]), Action::CheckIn)
            .await
            .unwrap_err();
        assert!(matches!(err, RosterError::Match(MatchError::InvalidEmbedding(_))));

        let report = roster.attendance("E1".into()).await.unwrap();
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn test_over_sqlite_store() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let roster = Roster::new(
            store.clone(),
            store,
            Threshold::new(0.6).unwrap(),
            None,
            Duration::from_secs(1),
        );
        roster
            .enroll_embedding(
                "E7".into(),
                Profile::new("Lin").with_attribute("department", "ops"),
                Embedding::new(vec![0.2, 0.9, 0.1]),
            )
            .await
            .unwrap();

        let outcome = roster
            .capture_embedding(Embedding::new(vec![0.21, 0.88, 0.1]), Action::CheckIn)
            .await
            .unwrap();
        assert!(matches!(outcome, CaptureOutcome::Logged { .. }));

        let listed = roster.identities().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].attributes["department"], "ops");
        let status = roster.status().unwrap();
        assert_eq!(status.identities, 1);
        assert_eq!(status.dimension, Some(3));
    }

    #[tokio::test]
    async fn test_concurrent_log_attendance_single_winner() {
        let roster = roster_with(None);
        roster
            .enroll_embedding("E3".into(), Profile::new("Cy"), Embedding::new(vec![1.0]))
            .await
            .unwrap();

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let roster = roster.clone();
                tokio::spawn(async move { roster.log_attendance("E3".into(), Action::CheckIn).await })
            })
            .collect();
        let mut successes = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => successes += 1,
                Err(RosterError::Ledger(LedgerError::AlreadyCheckedIn { .. })) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(successes, 1);
    }
}
