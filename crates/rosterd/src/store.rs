//! SQLite persistence for enrolled identities and attendance records.
//!
//! Profiles and embeddings live in separate tables keyed by identity id and are
//! only ever inserted together inside one transaction and read back through a
//! join. Matching reads a copy-on-write snapshot refreshed after each committed
//! enrollment, so recognition never waits on the connection.

use chrono::{DateTime, SecondsFormat, Utc};
use roster_core::ledger::{AttendanceBackend, LedgerError};
use roster_core::store::{validate_enrollment, EmbeddingStore, Snapshot, StoreError};
use roster_core::{AttendanceRecord, Embedding, Identity, Profile};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS profiles (
    identity_id   TEXT PRIMARY KEY,
    display_name  TEXT NOT NULL,
    attributes    TEXT NOT NULL,
    registered_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS embeddings (
    identity_id TEXT PRIMARY KEY REFERENCES profiles(identity_id),
    dimension   INTEGER NOT NULL,
    vector      BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    record_id   TEXT PRIMARY KEY,
    identity_id TEXT NOT NULL,
    check_in    TEXT NOT NULL,
    check_out   TEXT,
    CHECK (check_out IS NULL OR check_out >= check_in)
);
CREATE UNIQUE INDEX IF NOT EXISTS attendance_one_open
    ON attendance(identity_id) WHERE check_out IS NULL;
CREATE INDEX IF NOT EXISTS attendance_by_identity
    ON attendance(identity_id, check_in);
";

const IDENTITY_SELECT: &str = "
SELECT p.identity_id, p.display_name, p.attributes, p.registered_at, e.dimension, e.vector
FROM profiles p
JOIN embeddings e ON e.identity_id = p.identity_id
";

const RECORD_SELECT: &str =
    "SELECT record_id, identity_id, check_in, check_out FROM attendance";

/// Raw identity columns, decoded outside the rusqlite row closure.
struct IdentityRow {
    id: String,
    display_name: String,
    attributes: String,
    registered_at: String,
    dimension: i64,
    vector: Vec<u8>,
}

struct RecordRow {
    record_id: String,
    identity_id: String,
    check_in: String,
    check_out: Option<String>,
}

/// SQLite-backed [`EmbeddingStore`] and [`AttendanceBackend`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    snapshot: RwLock<Snapshot>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(unavailable)?;
        let store = Self::init(conn)?;
        tracing::info!(
            path = %path.display(),
            identities = store.current_snapshot().len(),
            "identity store opened"
        );
        Ok(store)
    }

    /// Private in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(unavailable)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(unavailable)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(unavailable)?;
        conn.execute_batch(SCHEMA_SQL).map_err(unavailable)?;
        let identities = load_identities(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            snapshot: RwLock::new(identities.into()),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_snapshot(&self) -> Snapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn open_record_in(
        conn: &Connection,
        identity_id: &str,
    ) -> Result<Option<AttendanceRecord>, LedgerError> {
        let sql = format!("{RECORD_SELECT} WHERE identity_id = ?1 AND check_out IS NULL");
        conn.query_row(&sql, params![identity_id], record_row)
            .optional()
            .map_err(ledger_unavailable)?
            .map(decode_record)
            .transpose()
    }
}

impl EmbeddingStore for SqliteStore {
    fn enroll(
        &self,
        identity_id: &str,
        embedding: Embedding,
        profile: Profile,
    ) -> Result<Identity, StoreError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;

        let dimension: Option<i64> = tx
            .query_row("SELECT dimension FROM embeddings LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(unavailable)?;
        validate_enrollment(
            identity_id,
            &embedding,
            &profile,
            dimension.map(|d| d as usize),
        )?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM profiles WHERE identity_id = ?1)",
                params![identity_id],
                |row| row.get(0),
            )
            .map_err(unavailable)?;
        if exists {
            return Err(StoreError::DuplicateIdentity(identity_id.to_string()));
        }

        let identity = Identity::new(identity_id, embedding, profile);
        let attributes = serde_json::to_string(&identity.attributes)
            .map_err(|e| StoreError::Unavailable(format!("encode attributes: {e}")))?;
        tx.execute(
            "INSERT INTO profiles (identity_id, display_name, attributes, registered_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                identity.id,
                identity.display_name,
                attributes,
                timestamp(identity.registered_at)
            ],
        )
        .map_err(unavailable)?;
        tx.execute(
            "INSERT INTO embeddings (identity_id, dimension, vector) VALUES (?1, ?2, ?3)",
            params![
                identity.id,
                identity.embedding.dim() as i64,
                identity.embedding.to_le_bytes()
            ],
        )
        .map_err(unavailable)?;
        tx.commit().map_err(unavailable)?;

        // Refresh while still holding the connection so snapshots follow commit order.
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let mut next: Vec<Identity> = snapshot.iter().cloned().collect();
        let pos = next.partition_point(|i| i.id < identity.id);
        next.insert(pos, identity.clone());
        *snapshot = next.into();
        drop(snapshot);

        tracing::info!(
            identity = identity_id,
            dim = identity.embedding.dim(),
            "identity enrolled"
        );
        Ok(identity)
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        Ok(self.current_snapshot())
    }

    fn get(&self, identity_id: &str) -> Result<Identity, StoreError> {
        let conn = self.conn();
        let sql = format!("{IDENTITY_SELECT} WHERE p.identity_id = ?1");
        let row = conn
            .query_row(&sql, params![identity_id], identity_row)
            .optional()
            .map_err(unavailable)?
            .ok_or_else(|| StoreError::NotFound(identity_id.to_string()))?;
        decode_identity(row)
    }

    fn dimension(&self) -> Result<Option<usize>, StoreError> {
        let conn = self.conn();
        let dimension: Option<i64> = conn
            .query_row("SELECT dimension FROM embeddings LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(unavailable)?;
        Ok(dimension.map(|d| d as usize))
    }
}

impl AttendanceBackend for SqliteStore {
    fn open_record(&self, identity_id: &str) -> Result<Option<AttendanceRecord>, LedgerError> {
        Self::open_record_in(&self.conn(), identity_id)
    }

    fn latest_record(&self, identity_id: &str) -> Result<Option<AttendanceRecord>, LedgerError> {
        let conn = self.conn();
        let sql = format!(
            "{RECORD_SELECT} WHERE identity_id = ?1 ORDER BY check_in DESC, check_out IS NOT NULL LIMIT 1"
        );
        conn.query_row(&sql, params![identity_id], record_row)
            .optional()
            .map_err(ledger_unavailable)?
            .map(decode_record)
            .transpose()
    }

    fn insert_open(&self, record: &AttendanceRecord) -> Result<(), LedgerError> {
        let check_in = record
            .check_in
            .ok_or_else(|| LedgerError::NotCheckedIn(record.identity_id.clone()))?;
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO attendance (record_id, identity_id, check_in, check_out)
             VALUES (?1, ?2, ?3, NULL)",
            params![
                record.record_id.to_string(),
                record.identity_id,
                timestamp(check_in)
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                // attendance_one_open: somebody else holds the open record.
                let since = Self::open_record_in(&conn, &record.identity_id)?
                    .and_then(|r| r.check_in)
                    .unwrap_or(check_in);
                Err(LedgerError::AlreadyCheckedIn {
                    identity_id: record.identity_id.clone(),
                    since,
                })
            }
            Err(e) => Err(ledger_unavailable(e)),
        }
    }

    fn close(
        &self,
        identity_id: &str,
        record_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, LedgerError> {
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE attendance SET check_out = ?3
                 WHERE record_id = ?1 AND identity_id = ?2 AND check_out IS NULL",
                params![record_id.to_string(), identity_id, timestamp(at)],
            )
            .map_err(ledger_unavailable)?;
        if updated == 0 {
            return Err(LedgerError::NotCheckedIn(identity_id.to_string()));
        }

        let sql = format!("{RECORD_SELECT} WHERE record_id = ?1");
        let row = conn
            .query_row(&sql, params![record_id.to_string()], record_row)
            .map_err(ledger_unavailable)?;
        decode_record(row)
    }

    fn history(&self, identity_id: &str) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let conn = self.conn();
        let sql = format!("{RECORD_SELECT} WHERE identity_id = ?1 ORDER BY check_in ASC");
        let mut stmt = conn.prepare(&sql).map_err(ledger_unavailable)?;
        let rows = stmt
            .query_map(params![identity_id], record_row)
            .map_err(ledger_unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(ledger_unavailable)?;
        rows.into_iter().map(decode_record).collect()
    }
}

/// Fixed-width RFC 3339 so that SQLite string comparison orders by time.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {s:?}: {e}"))
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn ledger_unavailable(e: rusqlite::Error) -> LedgerError {
    LedgerError::Unavailable(e.to_string())
}

fn identity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok(IdentityRow {
        id: row.get(0)?,
        display_name: row.get(1)?,
        attributes: row.get(2)?,
        registered_at: row.get(3)?,
        dimension: row.get(4)?,
        vector: row.get(5)?,
    })
}

fn record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        record_id: row.get(0)?,
        identity_id: row.get(1)?,
        check_in: row.get(2)?,
        check_out: row.get(3)?,
    })
}

fn decode_identity(row: IdentityRow) -> Result<Identity, StoreError> {
    let corrupt = |what: String| StoreError::Unavailable(format!("corrupt identity {}: {what}", row.id));

    let attributes: BTreeMap<String, String> =
        serde_json::from_str(&row.attributes).map_err(|e| corrupt(e.to_string()))?;
    let registered_at = parse_timestamp(&row.registered_at).map_err(corrupt)?;
    let embedding = Embedding::from_le_bytes(&row.vector)
        .ok_or_else(|| corrupt("vector length is not a multiple of 8".into()))?;
    if embedding.dim() as i64 != row.dimension {
        return Err(corrupt(format!(
            "stored dimension {} but vector has {}",
            row.dimension,
            embedding.dim()
        )));
    }

    Ok(Identity {
        id: row.id,
        display_name: row.display_name,
        attributes,
        embedding,
        registered_at,
    })
}

fn decode_record(row: RecordRow) -> Result<AttendanceRecord, LedgerError> {
    let corrupt = |what: String| {
        LedgerError::Unavailable(format!("corrupt attendance record {}: {what}", row.record_id))
    };
    Ok(AttendanceRecord {
        record_id: Uuid::parse_str(&row.record_id).map_err(|e| corrupt(e.to_string()))?,
        check_in: Some(parse_timestamp(&row.check_in).map_err(corrupt)?),
        check_out: row
            .check_out
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(corrupt)?,
        identity_id: row.identity_id,
    })
}

fn load_identities(conn: &Connection) -> Result<Vec<Identity>, StoreError> {
    let sql = format!("{IDENTITY_SELECT} ORDER BY p.identity_id");
    let mut stmt = conn.prepare(&sql).map_err(unavailable)?;
    let rows = stmt
        .query_map([], identity_row)
        .map_err(unavailable)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(unavailable)?;
    rows.into_iter().map(decode_identity).collect()
}
