use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use sqlmig_common::{Error, Result};
use tracing::{debug, info};

use crate::migrations::MigrationRecord;

/// Connection settings applied when a store is opened.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
    pub journal_mode: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5000),
            journal_mode: "WAL".to_string(),
        }
    }
}

/// Bookkeeping for one target database: the pending and applied tables live
/// in the same file as the schema they describe.
pub struct MigrationStore {
    conn: Connection,
}

/// A registered migration that has not been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMigration {
    pub timestamp: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A migration that has been applied, in application order by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

impl PendingMigration {
    pub fn record(&self) -> MigrationRecord {
        MigrationRecord::new(&self.timestamp, &self.name)
    }
}

impl AppliedMigration {
    pub fn record(&self) -> MigrationRecord {
        MigrationRecord::new(&self.timestamp, &self.name)
    }
}

impl MigrationStore {
    pub fn open(db_path: &Path, options: &StoreOptions) -> Result<Self> {
        info!("opening migration store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        Self::init(conn, options)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::init(conn, &StoreOptions::default())
    }

    fn init(conn: Connection, options: &StoreOptions) -> Result<Self> {
        conn.busy_timeout(options.busy_timeout)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode={}; PRAGMA foreign_keys=ON;",
            options.journal_mode
        ))
        .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS migrations_pending (
                    timestamp TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS migrations_applied (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    applied_at TEXT NOT NULL
                );",
            )
            .map_err(|e| Error::Database(format!("failed to create bookkeeping tables: {e}")))?;
        Ok(())
    }

    /// Add a new record to the pending set. Fails if the timestamp is already
    /// known to either set.
    pub fn register_pending(&mut self, record: &MigrationRecord) -> Result<PendingMigration> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        let known: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM migrations_pending WHERE timestamp = ?1)
                     OR EXISTS(SELECT 1 FROM migrations_applied WHERE timestamp = ?1)",
                params![record.timestamp],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to check existing migrations: {e}")))?;
        if known {
            return Err(Error::AlreadyExists(format!(
                "migration with timestamp {}",
                record.timestamp
            )));
        }

        let created_at = Utc::now();
        insert_pending(&tx, record, created_at)
            .map_err(|e| Error::Database(format!("failed to register migration: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit registration: {e}")))?;

        debug!("registered pending migration {record}");
        Ok(PendingMigration {
            timestamp: record.timestamp.clone(),
            name: record.name.clone(),
            created_at,
        })
    }

    /// All pending migrations in application order.
    pub fn pending(&self) -> Result<Vec<PendingMigration>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT timestamp, name, created_at
                 FROM migrations_pending
                 ORDER BY timestamp ASC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], pending_from_row)
            .map_err(|e| Error::Database(format!("failed to query pending migrations: {e}")))?;

        let mut pending = Vec::new();
        for row in rows {
            pending.push(
                row.map_err(|e| Error::Database(format!("failed to read pending row: {e}")))?,
            );
        }
        Ok(pending)
    }

    /// All applied migrations, oldest application first.
    pub fn applied(&self) -> Result<Vec<AppliedMigration>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, timestamp, name, applied_at
                 FROM migrations_applied
                 ORDER BY id ASC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], applied_from_row)
            .map_err(|e| Error::Database(format!("failed to query applied migrations: {e}")))?;

        let mut applied = Vec::new();
        for row in rows {
            applied.push(
                row.map_err(|e| Error::Database(format!("failed to read applied row: {e}")))?,
            );
        }
        Ok(applied)
    }

    pub fn last_applied(&self) -> Result<Option<AppliedMigration>> {
        self.conn
            .query_row(
                "SELECT id, timestamp, name, applied_at
                 FROM migrations_applied
                 ORDER BY id DESC
                 LIMIT 1",
                [],
                applied_from_row,
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to query last applied migration: {e}")))
    }

    /// Start a transaction holding SQLite's exclusive lock. Waits up to the
    /// busy timeout for other connections to let go.
    pub(crate) fn begin_exclusive(&mut self) -> rusqlite::Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
    }

    /// Direct access for inspecting the schema a migration produced.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub(crate) fn insert_pending(
    tx: &Transaction<'_>,
    record: &MigrationRecord,
    created_at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO migrations_pending (timestamp, name, created_at) VALUES (?1, ?2, ?3)",
        params![record.timestamp, record.name, created_at.to_rfc3339()],
    )?;
    Ok(())
}

/// Move a record from pending to applied. Returns the new applied row id.
pub(crate) fn mark_applied(
    tx: &Transaction<'_>,
    record: &MigrationRecord,
    applied_at: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    let removed = tx.execute(
        "DELETE FROM migrations_pending WHERE timestamp = ?1",
        params![record.timestamp],
    )?;
    if removed != 1 {
        return Err(rusqlite::Error::StatementChangedRows(removed));
    }
    tx.execute(
        "INSERT INTO migrations_applied (timestamp, name, applied_at) VALUES (?1, ?2, ?3)",
        params![record.timestamp, record.name, applied_at.to_rfc3339()],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Id of the most recent applied row, as seen by `tx`.
pub(crate) fn last_applied_id(tx: &Transaction<'_>) -> rusqlite::Result<Option<i64>> {
    tx.query_row("SELECT MAX(id) FROM migrations_applied", [], |row| row.get(0))
}

/// Move an applied row back into the pending set.
pub(crate) fn mark_pending(
    tx: &Transaction<'_>,
    applied: &AppliedMigration,
    created_at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let removed = tx.execute(
        "DELETE FROM migrations_applied WHERE id = ?1",
        params![applied.id],
    )?;
    if removed != 1 {
        return Err(rusqlite::Error::StatementChangedRows(removed));
    }
    insert_pending(tx, &applied.record(), created_at)
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingMigration> {
    Ok(PendingMigration {
        timestamp: row.get(0)?,
        name: row.get(1)?,
        created_at: datetime_column(row, 2)?,
    })
}

fn applied_from_row(row: &Row<'_>) -> rusqlite::Result<AppliedMigration> {
    Ok(AppliedMigration {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        name: row.get(2)?,
        applied_at: datetime_column(row, 3)?,
    })
}

fn datetime_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_datetime(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unrecognised timestamp {raw:?}").into(),
        )
    })
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            // SQLite datetime('now') produces "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(timestamp: &str, name: &str) -> MigrationRecord {
        MigrationRecord::new(timestamp, name)
    }

    #[test]
    fn new_store_has_empty_sets() {
        let store = MigrationStore::in_memory().unwrap();
        assert!(store.pending().unwrap().is_empty());
        assert!(store.applied().unwrap().is_empty());
        assert!(store.last_applied().unwrap().is_none());
    }

    #[test]
    fn pending_is_ordered_by_timestamp_not_insertion() {
        let mut store = MigrationStore::in_memory().unwrap();
        store
            .register_pending(&record("20240102", "second"))
            .unwrap();
        store.register_pending(&record("20240101", "first")).unwrap();

        let pending = store.pending().unwrap();
        let order: Vec<_> = pending.iter().map(|p| p.timestamp.as_str()).collect();
        assert_eq!(order, ["20240101", "20240102"]);
        assert_eq!(pending[0].name, "first");
    }

    #[test]
    fn register_rejects_duplicate_timestamp() {
        let mut store = MigrationStore::in_memory().unwrap();
        store.register_pending(&record("20240101", "a")).unwrap();
        let err = store
            .register_pending(&record("20240101", "b"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(store.pending().unwrap().len(), 1);
    }

    #[test]
    fn mark_applied_moves_record_between_sets() {
        let mut store = MigrationStore::in_memory().unwrap();
        let rec = record("20240101", "users");
        store.register_pending(&rec).unwrap();

        let tx = store.begin_exclusive().unwrap();
        let id = mark_applied(&tx, &rec, Utc::now()).unwrap();
        tx.commit().unwrap();

        assert!(store.pending().unwrap().is_empty());
        let last = store.last_applied().unwrap().unwrap();
        assert_eq!(last.id, id);
        assert_eq!(last.record(), rec);
    }

    #[test]
    fn register_rejects_timestamp_already_applied() {
        let mut store = MigrationStore::in_memory().unwrap();
        let rec = record("20240101", "users");
        store.register_pending(&rec).unwrap();
        let tx = store.begin_exclusive().unwrap();
        mark_applied(&tx, &rec, Utc::now()).unwrap();
        tx.commit().unwrap();

        let err = store.register_pending(&rec).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn mark_applied_fails_for_unregistered_record() {
        let mut store = MigrationStore::in_memory().unwrap();
        let tx = store.begin_exclusive().unwrap();
        let err = mark_applied(&tx, &record("20240101", "ghost"), Utc::now()).unwrap_err();
        assert!(matches!(err, rusqlite::Error::StatementChangedRows(0)));
    }

    #[test]
    fn last_applied_follows_insertion_order() {
        let mut store = MigrationStore::in_memory().unwrap();
        // Applied out of timestamp order on purpose.
        for (ts, name) in [("20240105", "late"), ("20240101", "early")] {
            let rec = record(ts, name);
            store.register_pending(&rec).unwrap();
            let tx = store.begin_exclusive().unwrap();
            mark_applied(&tx, &rec, Utc::now()).unwrap();
            tx.commit().unwrap();
        }

        assert_eq!(store.last_applied().unwrap().unwrap().name, "early");
        let names: Vec<_> = store
            .applied()
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, ["late", "early"]);
    }

    #[test]
    fn mark_pending_restores_record() {
        let mut store = MigrationStore::in_memory().unwrap();
        let rec = record("20240101", "users");
        store.register_pending(&rec).unwrap();
        let tx = store.begin_exclusive().unwrap();
        mark_applied(&tx, &rec, Utc::now()).unwrap();
        tx.commit().unwrap();

        let applied = store.last_applied().unwrap().unwrap();
        let tx = store.begin_exclusive().unwrap();
        mark_pending(&tx, &applied, Utc::now()).unwrap();
        tx.commit().unwrap();

        assert!(store.applied().unwrap().is_empty());
        assert_eq!(store.pending().unwrap()[0].record(), rec);
    }

    #[test]
    fn dropped_transaction_leaves_sets_untouched() {
        let mut store = MigrationStore::in_memory().unwrap();
        let rec = record("20240101", "users");
        store.register_pending(&rec).unwrap();
        {
            let tx = store.begin_exclusive().unwrap();
            mark_applied(&tx, &rec, Utc::now()).unwrap();
        }
        assert_eq!(store.pending().unwrap().len(), 1);
        assert!(store.applied().unwrap().is_empty());
    }

    #[test]
    fn parses_rfc3339_and_sqlite_datetimes() {
        assert!(parse_datetime("2024-01-01T10:00:00+00:00").is_some());
        let legacy = parse_datetime("2024-01-01 10:00:00").unwrap();
        assert_eq!(legacy.to_rfc3339(), "2024-01-01T10:00:00+00:00");
        assert!(parse_datetime("yesterday").is_none());
    }

    #[test]
    fn legacy_default_created_at_is_readable() {
        let store = MigrationStore::in_memory().unwrap();
        store
            .connection()
            .execute(
                "INSERT INTO migrations_pending (timestamp, name) VALUES ('20240101', 'legacy')",
                [],
            )
            .unwrap();
        let pending = store.pending().unwrap();
        assert_eq!(pending[0].name, "legacy");
    }

    #[test]
    fn open_creates_tables_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.db");
        {
            let mut store = MigrationStore::open(&path, &StoreOptions::default()).unwrap();
            store.register_pending(&record("20240101", "users")).unwrap();
        }
        let store = MigrationStore::open(&path, &StoreOptions::default()).unwrap();
        assert_eq!(store.pending().unwrap().len(), 1);
    }
}
