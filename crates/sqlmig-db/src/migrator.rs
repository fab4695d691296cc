use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlmig_common::{Error, Result, TxStage};
use tracing::{debug, info, warn};

use crate::migrations::{MigrationRecord, Section, load_section};
use crate::store::{self, AppliedMigration, MigrationStore, PendingMigration};

/// Drives migrations between the pending and applied sets.
///
/// Every transition runs inside one exclusive transaction covering both the
/// migration's SQL and the bookkeeping move, so the two can never disagree.
pub struct Migrator<'db> {
    store: &'db mut MigrationStore,
    migrations_dir: PathBuf,
}

/// What one `apply_pending` run did.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Committed migrations, in the order they were applied.
    pub applied: Vec<AppliedMigration>,
    /// Migrations left pending because their UP section was empty.
    pub skipped: Vec<MigrationRecord>,
    /// The migration that halted the run, if any. Nothing after it was tried.
    pub failure: Option<MigrationFailure>,
}

#[derive(Debug)]
pub struct MigrationFailure {
    pub migration: MigrationRecord,
    pub error: Error,
}

impl ApplyReport {
    /// True when there was nothing pending to look at.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.skipped.is_empty() && self.failure.is_none()
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Progress reported by [`Migrator::apply_pending_with`], in loop order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyEvent<'a> {
    /// The UP section was empty; the record stays pending.
    Skipped(&'a MigrationRecord),
    /// About to take the lock and run the UP section.
    Applying(&'a MigrationRecord),
    /// Committed.
    Applied(&'a AppliedMigration),
}

#[derive(Debug)]
pub enum RollbackOutcome {
    NothingToRollBack,
    /// The latest applied migration has no DOWN section; it stays applied.
    NoDownSection(AppliedMigration),
    RolledBack(PendingMigration),
}

impl<'db> Migrator<'db> {
    pub fn new(store: &'db mut MigrationStore, migrations_dir: impl Into<PathBuf>) -> Result<Self> {
        let migrations_dir = migrations_dir.into();
        if !migrations_dir.is_dir() {
            return Err(Error::DirectoryNotFound(migrations_dir));
        }
        Ok(Self {
            store,
            migrations_dir,
        })
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Apply every pending migration in timestamp order, stopping at the
    /// first failure. Earlier commits stay committed.
    pub fn apply_pending(&mut self) -> Result<ApplyReport> {
        self.apply_pending_with(|_| {})
    }

    /// Like [`Migrator::apply_pending`], calling `on_event` for each step as
    /// it happens so callers can report progress before the batch ends.
    pub fn apply_pending_with<F>(&mut self, mut on_event: F) -> Result<ApplyReport>
    where
        F: FnMut(ApplyEvent<'_>),
    {
        let pending = self.store.pending()?;
        let mut report = ApplyReport::default();

        if pending.is_empty() {
            info!("no pending migrations");
            return Ok(report);
        }

        for migration in pending {
            let record = migration.record();
            let path = record.path_in(&self.migrations_dir);

            let sql = match load_section(&path, Section::Up) {
                Ok(Some(sql)) => sql,
                Ok(None) => {
                    warn!("skipping {record}: empty UP section");
                    on_event(ApplyEvent::Skipped(&record));
                    report.skipped.push(record);
                    continue;
                }
                Err(error) => {
                    warn!("halting at {record}: {error}");
                    report.failure = Some(MigrationFailure {
                        migration: record,
                        error,
                    });
                    break;
                }
            };

            on_event(ApplyEvent::Applying(&record));
            match self.apply_one(&record, &sql) {
                Ok(applied) => {
                    info!("applied migration {record}");
                    on_event(ApplyEvent::Applied(&applied));
                    report.applied.push(applied);
                }
                Err(error) => {
                    warn!("halting at {record}: {error}");
                    report.failure = Some(MigrationFailure {
                        migration: record,
                        error,
                    });
                    break;
                }
            }
        }

        Ok(report)
    }

    fn apply_one(&mut self, record: &MigrationRecord, sql: &str) -> Result<AppliedMigration> {
        let id = record.to_string();
        let tx = self
            .store
            .begin_exclusive()
            .map_err(|e| Error::transaction(&id, TxStage::Begin, e))?;

        debug!("executing UP for {id}");
        tx.execute_batch(sql)
            .map_err(|e| Error::transaction(&id, TxStage::Execute, e))?;

        let applied_at = Utc::now();
        let row_id = store::mark_applied(&tx, record, applied_at)
            .map_err(|e| Error::transaction(&id, TxStage::Bookkeeping, e))?;

        tx.commit()
            .map_err(|e| Error::transaction(&id, TxStage::Commit, e))?;

        Ok(AppliedMigration {
            id: row_id,
            timestamp: record.timestamp.clone(),
            name: record.name.clone(),
            applied_at,
        })
    }

    /// Undo the most recently applied migration.
    pub fn rollback_last(&mut self) -> Result<RollbackOutcome> {
        let Some(applied) = self.store.last_applied()? else {
            info!("no applied migrations to roll back");
            return Ok(RollbackOutcome::NothingToRollBack);
        };

        let record = applied.record();
        let path = record.path_in(&self.migrations_dir);
        let Some(sql) = load_section(&path, Section::Down)? else {
            warn!("refusing to roll back {record}: no DOWN section");
            return Ok(RollbackOutcome::NoDownSection(applied));
        };

        let pending = self.revert_one(&applied, &sql)?;
        info!("rolled back migration {record}");
        Ok(RollbackOutcome::RolledBack(pending))
    }

    /// Run `sql` as the inverse of `applied` and move it back to pending.
    ///
    /// `applied` was read before the lock was taken, so it is checked again
    /// under the lock: if another connection applied something newer in the
    /// meantime, nothing runs.
    fn revert_one(&mut self, applied: &AppliedMigration, sql: &str) -> Result<PendingMigration> {
        let record = applied.record();
        let id = record.to_string();
        let tx = self
            .store
            .begin_exclusive()
            .map_err(|e| Error::transaction(&id, TxStage::Begin, e))?;

        let latest = store::last_applied_id(&tx)
            .map_err(|e| Error::transaction(&id, TxStage::Bookkeeping, e))?;
        if latest != Some(applied.id) {
            return Err(Error::transaction(
                &id,
                TxStage::Bookkeeping,
                format!(
                    "applied set changed since it was read (latest id is now {latest:?}, expected {})",
                    applied.id
                ),
            ));
        }

        debug!("executing DOWN for {id}");
        tx.execute_batch(sql)
            .map_err(|e| Error::transaction(&id, TxStage::Execute, e))?;

        let created_at = Utc::now();
        store::mark_pending(&tx, applied, created_at)
            .map_err(|e| Error::transaction(&id, TxStage::Bookkeeping, e))?;

        tx.commit()
            .map_err(|e| Error::transaction(&id, TxStage::Commit, e))?;

        Ok(PendingMigration {
            timestamp: record.timestamp,
            name: record.name,
            created_at,
        })
    }
}
