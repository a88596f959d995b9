//! roster-core — Identity matching and attendance state machine.
//!
//! Enrolled identities live in an [`EmbeddingStore`]; a live embedding is
//! resolved against a store snapshot by a [`Matcher`]; the resolved identity
//! is checked in or out through an [`AttendanceLedger`]. Embedding extraction
//! is an external concern behind [`EmbeddingExtractor`].

pub mod extract;
pub mod ledger;
pub mod matcher;
pub mod store;
pub mod types;

pub use extract::{parse_represent_output, EmbeddingExtractor, ExtractError};
pub use ledger::{AttendanceBackend, AttendanceLedger, AttendanceState, LedgerError, MemoryLedger};
pub use matcher::{Candidate, CosineMatcher, MatchError, MatchResult, Matcher, Threshold};
pub use store::{EmbeddingStore, MemoryStore, Snapshot, StoreError};
pub use types::{Action, AttendanceRecord, Embedding, Identity, InvalidAction, Profile};
