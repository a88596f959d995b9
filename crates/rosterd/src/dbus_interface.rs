use crate::engine::EngineError;
use crate::service::{Roster, RosterError};
use roster_core::extract::ExtractError;
use roster_core::ledger::LedgerError;
use roster_core::matcher::MatchError;
use roster_core::store::StoreError;
use roster_core::{Action, Embedding, Profile};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use zbus::{interface, DBusError};

pub const BUS_NAME: &str = "io.sovren.Roster1";
pub const OBJECT_PATH: &str = "/io/sovren/Roster1";

/// Typed D-Bus errors, one name per failure kind (`io.sovren.Roster1.Error.<Kind>`).
#[derive(Debug, DBusError)]
#[zbus(prefix = "io.sovren.Roster1.Error")]
pub enum ServiceError {
    #[zbus(error)]
    ZBus(zbus::Error),
    DimensionMismatch(String),
    DuplicateIdentity(String),
    NotFound(String),
    NoFaceDetected(String),
    AlreadyCheckedIn(String),
    NotCheckedIn(String),
    InvalidArgument(String),
    ExtractionFailed(String),
    StorageUnavailable(String),
    Timeout(String),
    Internal(String),
}

impl From<RosterError> for ServiceError {
    fn from(err: RosterError) -> Self {
        let msg = err.to_string();
        match err {
            RosterError::Store(e) => match e {
                StoreError::DuplicateIdentity(_) => Self::DuplicateIdentity(msg),
                StoreError::DimensionMismatch { .. } => Self::DimensionMismatch(msg),
                StoreError::NotFound(_) => Self::NotFound(msg),
                StoreError::InvalidIdentity(_) | StoreError::InvalidEmbedding(_) => {
                    Self::InvalidArgument(msg)
                }
                StoreError::Unavailable(_) => Self::StorageUnavailable(msg),
            },
            RosterError::Match(e) => match e {
                MatchError::DimensionMismatch { .. } => Self::DimensionMismatch(msg),
                MatchError::InvalidThreshold(_) | MatchError::InvalidEmbedding(_) => {
                    Self::InvalidArgument(msg)
                }
            },
            RosterError::Ledger(e) => match e {
                LedgerError::AlreadyCheckedIn { .. } => Self::AlreadyCheckedIn(msg),
                LedgerError::NotCheckedIn(_) => Self::NotCheckedIn(msg),
                LedgerError::CheckOutBeforeCheckIn { .. }
                | LedgerError::CheckInBeforeLastCheckOut { .. }
                | LedgerError::InvalidIdentity(_) => Self::InvalidArgument(msg),
                LedgerError::Unavailable(_) => Self::StorageUnavailable(msg),
            },
            RosterError::Engine(EngineError::Extract(ExtractError::NoFaceDetected)) => {
                Self::NoFaceDetected(msg)
            }
            RosterError::Engine(EngineError::Extract(ExtractError::ExtractionFailed(_)))
            | RosterError::ExtractorUnavailable => Self::ExtractionFailed(msg),
            RosterError::Engine(_) | RosterError::Task(_) => Self::Internal(msg),
            RosterError::InvalidAction(_) => Self::InvalidArgument(msg),
            RosterError::Timeout(_) => Self::Timeout(msg),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ServiceError> {
    serde_json::to_string(value).map_err(|e| ServiceError::Internal(e.to_string()))
}

fn parse_action(action: &str) -> Result<Action, ServiceError> {
    action
        .parse::<Action>()
        .map_err(|e| ServiceError::from(RosterError::from(e)))
}

fn profile(name: &str, attributes: HashMap<String, String>) -> Profile {
    Profile {
        display_name: name.to_string(),
        attributes: attributes.into_iter().collect::<BTreeMap<_, _>>(),
    }
}

/// D-Bus interface for the Roster attendance daemon.
///
/// Bus name: io.sovren.Roster1
/// Object path: /io/sovren/Roster1
///
/// Every reply is a JSON document.
pub struct RosterService {
    roster: Roster,
}

impl RosterService {
    pub fn new(roster: Roster) -> Self {
        Self { roster }
    }
}

#[interface(name = "io.sovren.Roster1")]
impl RosterService {
    /// Enroll a new identity from a face image on the daemon's filesystem.
    async fn enroll(
        &self,
        id: &str,
        name: &str,
        attributes: HashMap<String, String>,
        image_path: &str,
    ) -> Result<String, ServiceError> {
        tracing::info!(id, image_path, "enroll requested");
        let summary = self
            .roster
            .enroll_image(id.to_string(), profile(name, attributes), PathBuf::from(image_path))
            .await?;
        to_json(&summary)
    }

    /// Enroll a new identity from a precomputed embedding.
    async fn enroll_embedding(
        &self,
        id: &str,
        name: &str,
        attributes: HashMap<String, String>,
        embedding: Vec<f64>,
    ) -> Result<String, ServiceError> {
        tracing::info!(id, dim = embedding.len(), "enroll_embedding requested");
        let summary = self
            .roster
            .enroll_embedding(id.to_string(), profile(name, attributes), Embedding::new(embedding))
            .await?;
        to_json(&summary)
    }

    /// Identify the face in an image.
    async fn recognize(&self, image_path: &str) -> Result<String, ServiceError> {
        tracing::info!(image_path, "recognize requested");
        let result = self.roster.recognize_image(PathBuf::from(image_path)).await?;
        to_json(&result)
    }

    /// Identify a precomputed live embedding.
    async fn recognize_embedding(&self, embedding: Vec<f64>) -> Result<String, ServiceError> {
        tracing::info!(dim = embedding.len(), "recognize_embedding requested");
        let result = self.roster.recognize(Embedding::new(embedding)).await?;
        to_json(&result)
    }

    /// Recognize the face in an image and check that person in or out.
    async fn capture_attendance(&self, image_path: &str, action: &str) -> Result<String, ServiceError> {
        tracing::info!(image_path, action, "capture_attendance requested");
        let action = parse_action(action)?;
        let outcome = self
            .roster
            .capture_attendance(PathBuf::from(image_path), action)
            .await?;
        to_json(&outcome)
    }

    /// Check an enrolled identity in or out by id.
    async fn log_attendance(&self, id: &str, action: &str) -> Result<String, ServiceError> {
        tracing::info!(id, action, "log_attendance requested");
        let action = parse_action(action)?;
        let record = self.roster.log_attendance(id.to_string(), action).await?;
        to_json(&record)
    }

    /// Current state and full history for an identity.
    async fn attendance(&self, id: &str) -> Result<String, ServiceError> {
        let report = self.roster.attendance(id.to_string()).await?;
        to_json(&report)
    }

    /// List enrolled identities (without embeddings).
    async fn list_identities(&self) -> Result<String, ServiceError> {
        to_json(&self.roster.identities()?)
    }

    /// Return daemon status information.
    async fn status(&self) -> Result<String, ServiceError> {
        to_json(&self.roster.status()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use roster_core::types::EmbeddingError;

    #[test]
    fn test_error_kinds_map_to_distinct_names() {
        let cases: Vec<(RosterError, &str)> = vec![
            (StoreError::DuplicateIdentity("E1".into()).into(), "DuplicateIdentity"),
            (
                StoreError::DimensionMismatch { expected: 2, got: 3 }.into(),
                "DimensionMismatch",
            ),
            (
                MatchError::DimensionMismatch { expected: 2, got: 3 }.into(),
                "DimensionMismatch",
            ),
            (
                MatchError::InvalidEmbedding(EmbeddingError::Empty).into(),
                "InvalidArgument",
            ),
            (StoreError::NotFound("E1".into()).into(), "NotFound"),
            (StoreError::Unavailable("locked".into()).into(), "StorageUnavailable"),
            (LedgerError::Unavailable("locked".into()).into(), "StorageUnavailable"),
            (
                LedgerError::AlreadyCheckedIn {
                    identity_id: "E1".into(),
                    since: Utc::now(),
                }
                .into(),
                "AlreadyCheckedIn",
            ),
            (LedgerError::NotCheckedIn("E2".into()).into(), "NotCheckedIn"),
            (
                EngineError::Extract(ExtractError::NoFaceDetected).into(),
                "NoFaceDetected",
            ),
            (RosterError::ExtractorUnavailable, "ExtractionFailed"),
            (
                RosterError::Timeout(std::time::Duration::from_secs(3)),
                "Timeout",
            ),
        ];

        for (err, expected) in cases {
            let mapped = ServiceError::from(err);
            let kind = format!("{mapped:?}");
            assert!(
                kind.starts_with(expected),
                "expected {expected}, got {kind}"
            );
        }
    }

    #[test]
    fn test_invalid_action_is_invalid_argument() {
        assert!(matches!(
            parse_action("punch"),
            Err(ServiceError::InvalidArgument(_))
        ));
        assert_eq!(parse_action("check_out").unwrap(), Action::CheckOut);
    }

    #[test]
    fn test_profile_from_dbus_attributes() {
        let attrs = HashMap::from([
            ("gender".to_string(), "F".to_string()),
            ("age".to_string(), "29".to_string()),
        ]);
        let p = profile("Noor", attrs);
        assert_eq!(p.display_name, "Noor");
        let keys: Vec<&str> = p.attributes.keys().map(String::as_str).collect();
        assert_eq!(keys, ["age", "gender"]);
    }
}
