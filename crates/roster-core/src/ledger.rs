//! Attendance state machine.
//!
//! Per identity: `NotCheckedIn` -> `CheckedIn` -> `CheckedOut` -> `CheckedIn` ...
//! Transitions for one identity are serialized through a lock table keyed by
//! identity id; different identities never share a lock. Backends must also
//! refuse a second open record on their own (conditional write), so the
//! invariant holds even if two ledgers share one backend.

use crate::types::{Action, AttendanceRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{identity_id} is already checked in (since {since})")]
    AlreadyCheckedIn {
        identity_id: String,
        since: DateTime<Utc>,
    },
    #[error("{0} is not checked in")]
    NotCheckedIn(String),
    #[error("check-out at {at} precedes check-in at {check_in}")]
    CheckOutBeforeCheckIn {
        check_in: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    #[error("check-in at {at} precedes previous check-out at {last_check_out}")]
    CheckInBeforeLastCheckOut {
        last_check_out: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Where an identity currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "record", rename_all = "snake_case")]
pub enum AttendanceState {
    NotCheckedIn,
    CheckedIn(AttendanceRecord),
    CheckedOut(AttendanceRecord),
}

/// Persistence contract for attendance records.
///
/// `insert_open` and `close` are conditional writes: each either applies
/// exactly one record mutation or fails leaving storage untouched.
pub trait AttendanceBackend: Send + Sync {
    /// The identity's open record, if any.
    fn open_record(&self, identity_id: &str) -> Result<Option<AttendanceRecord>, LedgerError>;

    /// Most recent record by check-in time, open or closed.
    fn latest_record(&self, identity_id: &str) -> Result<Option<AttendanceRecord>, LedgerError>;

    /// Insert `record` (which is open). Fails with `AlreadyCheckedIn` if the
    /// identity already has an open record.
    fn insert_open(&self, record: &AttendanceRecord) -> Result<(), LedgerError>;

    /// Set `check_out` on the given record. Fails with `NotCheckedIn` if that
    /// record is not open.
    fn close(
        &self,
        identity_id: &str,
        record_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, LedgerError>;

    /// All records for the identity, oldest check-in first.
    fn history(&self, identity_id: &str) -> Result<Vec<AttendanceRecord>, LedgerError>;
}

impl<T: AttendanceBackend + ?Sized> AttendanceBackend for Arc<T> {
    fn open_record(&self, identity_id: &str) -> Result<Option<AttendanceRecord>, LedgerError> {
        (**self).open_record(identity_id)
    }

    fn latest_record(&self, identity_id: &str) -> Result<Option<AttendanceRecord>, LedgerError> {
        (**self).latest_record(identity_id)
    }

    fn insert_open(&self, record: &AttendanceRecord) -> Result<(), LedgerError> {
        (**self).insert_open(record)
    }

    fn close(
        &self,
        identity_id: &str,
        record_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, LedgerError> {
        (**self).close(identity_id, record_id, at)
    }

    fn history(&self, identity_id: &str) -> Result<Vec<AttendanceRecord>, LedgerError> {
        (**self).history(identity_id)
    }
}

/// Arena of per-identity locks. A slot lives only while some caller holds or
/// waits on it, so the table stays as small as the set of in-flight identities.
#[derive(Default)]
struct LockTable {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    fn slot(&self, identity_id: &str) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(identity_id.to_string()).or_default().clone()
    }

    /// Give back a slot from [`slot`](Self::slot); the entry is dropped once
    /// nobody else references it.
    fn release(&self, identity_id: &str, slot: Arc<Mutex<()>>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        drop(slot);
        if slots
            .get(identity_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            slots.remove(identity_id);
        }
    }

    /// Run `f` while holding the lock for `identity_id`.
    fn with_lock<T>(&self, identity_id: &str, f: impl FnOnce() -> T) -> T {
        let slot = self.slot(identity_id);
        let out = {
            let _guard = slot.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };
        self.release(identity_id, slot);
        out
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Check-in/check-out ledger over an [`AttendanceBackend`].
pub struct AttendanceLedger<B> {
    backend: B,
    locks: LockTable,
}

impl<B: AttendanceBackend> AttendanceLedger<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            locks: LockTable::default(),
        }
    }

    /// Open a new record. Allowed from `NotCheckedIn` and `CheckedOut`.
    pub fn check_in(
        &self,
        identity_id: &str,
        at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, LedgerError> {
        check_identity(identity_id)?;
        self.locks
            .with_lock(identity_id, || self.check_in_locked(identity_id, at))
    }

    fn check_in_locked(
        &self,
        identity_id: &str,
        at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, LedgerError> {
        match self.backend.latest_record(identity_id)? {
            Some(rec) if rec.is_open() => {
                return Err(LedgerError::AlreadyCheckedIn {
                    identity_id: identity_id.to_string(),
                    since: rec.check_in.unwrap_or(at),
                });
            }
            Some(AttendanceRecord {
                check_out: Some(last_check_out),
                ..
            }) if at < last_check_out => {
                return Err(LedgerError::CheckInBeforeLastCheckOut { last_check_out, at });
            }
            _ => {}
        }

        let record = AttendanceRecord::open(identity_id, at);
        self.backend.insert_open(&record)?;
        tracing::info!(identity = identity_id, record = %record.record_id, %at, "checked in");
        Ok(record)
    }

    /// Close the open record. Allowed only from `CheckedIn`; `at` must not
    /// precede the check-in.
    pub fn check_out(
        &self,
        identity_id: &str,
        at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, LedgerError> {
        check_identity(identity_id)?;
        self.locks
            .with_lock(identity_id, || self.check_out_locked(identity_id, at))
    }

    fn check_out_locked(
        &self,
        identity_id: &str,
        at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, LedgerError> {
        let open = self
            .backend
            .open_record(identity_id)?
            .ok_or_else(|| LedgerError::NotCheckedIn(identity_id.to_string()))?;
        if let Some(check_in) = open.check_in {
            if at < check_in {
                return Err(LedgerError::CheckOutBeforeCheckIn { check_in, at });
            }
        }

        let record = self.backend.close(identity_id, open.record_id, at)?;
        tracing::info!(identity = identity_id, record = %record.record_id, %at, "checked out");
        Ok(record)
    }

    pub fn transition(
        &self,
        identity_id: &str,
        action: Action,
        at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, LedgerError> {
        match action {
            Action::CheckIn => self.check_in(identity_id, at),
            Action::CheckOut => self.check_out(identity_id, at),
        }
    }

    pub fn state(&self, identity_id: &str) -> Result<AttendanceState, LedgerError> {
        Ok(match self.backend.latest_record(identity_id)? {
            None => AttendanceState::NotCheckedIn,
            Some(rec) if rec.is_open() => AttendanceState::CheckedIn(rec),
            Some(rec) => AttendanceState::CheckedOut(rec),
        })
    }

    pub fn history(&self, identity_id: &str) -> Result<Vec<AttendanceRecord>, LedgerError> {
        self.backend.history(identity_id)
    }
}

fn check_identity(identity_id: &str) -> Result<(), LedgerError> {
    if identity_id.trim().is_empty() {
        return Err(LedgerError::InvalidIdentity("identity id is empty".into()));
    }
    Ok(())
}

/// In-process attendance backend.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<String, Vec<AttendanceRecord>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttendanceBackend for MemoryLedger {
    fn open_record(&self, identity_id: &str) -> Result<Option<AttendanceRecord>, LedgerError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(identity_id)
            .and_then(|recs| recs.iter().find(|r| r.is_open()).cloned()))
    }

    fn latest_record(&self, identity_id: &str) -> Result<Option<AttendanceRecord>, LedgerError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .get(identity_id)
            .and_then(|recs| recs.iter().max_by_key(|r| r.check_in).cloned()))
    }

    fn insert_open(&self, record: &AttendanceRecord) -> Result<(), LedgerError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let recs = records.entry(record.identity_id.clone()).or_default();
        if let Some(open) = recs.iter().find(|r| r.is_open()) {
            return Err(LedgerError::AlreadyCheckedIn {
                identity_id: record.identity_id.clone(),
                since: open.check_in.unwrap_or_default(),
            });
        }
        recs.push(record.clone());
        Ok(())
    }

    fn close(
        &self,
        identity_id: &str,
        record_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, LedgerError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let rec = records
            .get_mut(identity_id)
            .and_then(|recs| {
                recs.iter_mut()
                    .find(|r| r.record_id == record_id && r.is_open())
            })
            .ok_or_else(|| LedgerError::NotCheckedIn(identity_id.to_string()))?;
        rec.check_out = Some(at);
        Ok(rec.clone())
    }

    fn history(&self, identity_id: &str) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut recs = records.get(identity_id).cloned().unwrap_or_default();
        recs.sort_by_key(|r| r.check_in);
        Ok(recs)
    }
}
