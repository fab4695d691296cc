use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlmig_common::Error;
use sqlmig_config::{ConfigLoader, ProjectConfig};
use sqlmig_db::migrations::{self, MigrationRecord};
use sqlmig_db::store::StoreOptions;
use sqlmig_db::{
    AppliedMigration, ApplyEvent, MigrationStore, Migrator, PendingMigration, RollbackOutcome,
};
use tracing::{debug, info};

/// Resolved locations and settings for one invocation.
pub struct Project {
    pub root: PathBuf,
    pub config: ProjectConfig,
}

impl Project {
    pub fn load(root: &Path, config_path: Option<&Path>) -> Result<Self> {
        let config = ConfigLoader::load(root, config_path)
            .with_context(|| format!("failed to load config for {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    fn store_options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: self.config.busy_timeout(),
            journal_mode: self.config.journal_mode.as_pragma().to_string(),
        }
    }

    fn open_store(&self) -> Result<MigrationStore> {
        MigrationStore::open(&self.config.database_file, &self.store_options()).with_context(
            || {
                format!(
                    "failed to open database {}",
                    self.config.database_file.display()
                )
            },
        )
    }

    /// Whether any file in the migrations directory already uses `timestamp`.
    fn timestamp_in_use(&self, timestamp: &str) -> Result<bool> {
        let prefix = format!("{timestamp}_");
        let entries = std::fs::read_dir(&self.config.migrations_dir).with_context(|| {
            format!("failed to list {}", self.config.migrations_dir.display())
        })?;
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fail before touching the database when the project was never set up.
    fn require_migrations_dir(&self) -> Result<()> {
        if !self.config.migrations_dir.is_dir() {
            return Err(Error::DirectoryNotFound(self.config.migrations_dir.clone()))
                .context("run `sqlmig init` first");
        }
        Ok(())
    }
}

pub fn init(project: &Project, out: &mut impl Write) -> Result<()> {
    std::fs::create_dir_all(&project.config.migrations_dir).with_context(|| {
        format!(
            "failed to create {}",
            project.config.migrations_dir.display()
        )
    })?;
    if let Some(parent) = project.config.database_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    project.open_store()?;

    info!("initialised project at {}", project.root.display());
    writeln!(
        out,
        "Initialised {} (migrations in {}, database {})",
        project.root.display(),
        project.config.migrations_dir.display(),
        project.config.database_file.display()
    )?;
    Ok(())
}

/// How many later seconds `create` tries when its timestamp is taken.
const CREATE_ATTEMPTS: i64 = 60;

pub fn create(project: &Project, raw_name: &str, out: &mut impl Write) -> Result<()> {
    project.require_migrations_dir()?;
    let name = migrations::normalize_name(raw_name)?;
    let mut store = project.open_store()?;

    let now = Utc::now();
    for offset in 0..CREATE_ATTEMPTS {
        let record = MigrationRecord::new(
            migrations::timestamp_for(now + Duration::seconds(offset)),
            name.clone(),
        );
        if let Some(path) = try_create(project, &mut store, &record, now)? {
            writeln!(out, "Created {}", path.display())?;
            return Ok(());
        }
        debug!("timestamp {} is taken, trying the next second", record.timestamp);
    }

    bail!(
        "no free timestamp within {CREATE_ATTEMPTS}s of {}",
        migrations::timestamp_for(now)
    )
}

/// Write and register one candidate. `None` means the timestamp is already
/// used by a file or a registered record.
fn try_create(
    project: &Project,
    store: &mut MigrationStore,
    record: &MigrationRecord,
    now: DateTime<Utc>,
) -> Result<Option<PathBuf>> {
    if project.timestamp_in_use(&record.timestamp)? {
        return Ok(None);
    }
    let path = record.path_in(&project.config.migrations_dir);

    let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to create {}", path.display())),
    };
    file.write_all(migrations::template(record, now).as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    drop(file);

    match store.register_pending(record) {
        Ok(_) => Ok(Some(path)),
        Err(e) => {
            // Leave no orphan file behind for a record the store refused.
            let _ = std::fs::remove_file(&path);
            match e {
                Error::AlreadyExists(_) => Ok(None),
                e => Err(e).context("failed to register migration"),
            }
        }
    }
}

#[derive(Serialize)]
struct StatusReport {
    pending: Vec<PendingMigration>,
    applied: Vec<AppliedMigration>,
}

pub fn status(project: &Project, json: bool, out: &mut impl Write) -> Result<()> {
    project.require_migrations_dir()?;
    let store = project.open_store()?;
    let report = StatusReport {
        pending: store.pending()?,
        applied: store.applied()?,
    };

    if json {
        serde_json::to_writer_pretty(&mut *out, &report)?;
        writeln!(out)?;
        return Ok(());
    }

    writeln!(out, "Applied ({}):", report.applied.len())?;
    for applied in &report.applied {
        writeln!(
            out,
            "  {}  {}  applied {}",
            applied.timestamp,
            applied.name,
            applied.applied_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
    }
    writeln!(out, "Pending ({}):", report.pending.len())?;
    for pending in &report.pending {
        writeln!(out, "  {}  {}", pending.timestamp, pending.name)?;
    }
    Ok(())
}

pub fn update(project: &Project, out: &mut impl Write) -> Result<()> {
    project.require_migrations_dir()?;
    let mut store = project.open_store()?;

    // Lines are written as each step happens; the first write error is kept
    // and returned once the batch is over.
    let mut write_error = None;
    let report = Migrator::new(&mut store, &project.config.migrations_dir)?.apply_pending_with(
        |event| {
            if write_error.is_none() {
                if let Err(e) = write_event(&mut *out, event) {
                    write_error = Some(e);
                }
            }
        },
    )?;
    if let Some(e) = write_error {
        return Err(e).context("failed to write progress");
    }

    if report.is_noop() {
        writeln!(out, "No pending migrations.")?;
        return Ok(());
    }

    match report.failure {
        Some(failure) => Err(failure.error)
            .with_context(|| format!("migration {} was not applied", failure.migration)),
        None => Ok(()),
    }
}

fn write_event(out: &mut impl Write, event: ApplyEvent<'_>) -> std::io::Result<()> {
    match event {
        ApplyEvent::Skipped(record) => writeln!(out, "Skipped {record} (empty UP section)")?,
        ApplyEvent::Applying(record) => writeln!(out, "Applying {record}...")?,
        ApplyEvent::Applied(applied) => writeln!(out, "Applied {}", applied.record())?,
    }
    out.flush()
}

pub fn rollback(project: &Project, out: &mut impl Write) -> Result<()> {
    project.require_migrations_dir()?;
    let mut store = project.open_store()?;
    let outcome = Migrator::new(&mut store, &project.config.migrations_dir)?.rollback_last()?;

    match outcome {
        RollbackOutcome::NothingToRollBack => writeln!(out, "No migrations to roll back.")?,
        RollbackOutcome::NoDownSection(applied) => writeln!(
            out,
            "Cannot roll back {}: no DOWN section. Nothing changed.",
            applied.record()
        )?,
        RollbackOutcome::RolledBack(pending) => {
            writeln!(out, "Rolled back {}", pending.record())?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> (tempfile::TempDir, Project) {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::load(&dir.path().join("sqlmig"), None).unwrap();
        (dir, project)
    }

    fn output(f: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn migration_files(project: &Project) -> Vec<PathBuf> {
        let mut entries: Vec<_> = std::fs::read_dir(&project.config.migrations_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        entries.sort();
        entries
    }

    fn only_migration(project: &Project) -> PathBuf {
        let mut entries = migration_files(project);
        assert_eq!(entries.len(), 1);
        entries.remove(0)
    }

    #[test]
    fn commands_require_init() {
        let (_dir, project) = project();
        let err = update(&project, &mut std::io::sink()).unwrap_err();
        assert!(err.to_string().contains("sqlmig init"));
        assert!(!project.config.database_file.exists());
    }

    #[test]
    fn init_is_idempotent() {
        let (_dir, project) = project();
        init(&project, &mut std::io::sink()).unwrap();
        init(&project, &mut std::io::sink()).unwrap();
        assert!(project.config.migrations_dir.is_dir());
        assert!(project.config.database_file.is_file());
    }

    #[test]
    fn create_writes_template_and_registers_pending() {
        let (_dir, project) = project();
        init(&project, &mut std::io::sink()).unwrap();

        let text = output(|out| create(&project, "Create Users", out));
        assert!(text.starts_with("Created "));

        let path = only_migration(&project);
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.ends_with("_create_users.sql"), "{file_name}");

        let store = project.open_store().unwrap();
        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record().file_name(), file_name);
    }

    #[test]
    fn create_rejects_bad_names() {
        let (_dir, project) = project();
        init(&project, &mut std::io::sink()).unwrap();
        assert!(create(&project, "drop;users", &mut std::io::sink()).is_err());
        assert!(project.open_store().unwrap().pending().unwrap().is_empty());
    }

    #[test]
    fn update_and_rollback_report_each_step() {
        let (_dir, project) = project();
        init(&project, &mut std::io::sink()).unwrap();
        create(&project, "notes", &mut std::io::sink()).unwrap();

        let text = output(|out| update(&project, out));
        assert!(text.contains("Skipped"), "{text}");

        let path = only_migration(&project);
        std::fs::write(
            &path,
            "-- UP\nCREATE TABLE notes(body TEXT);\n-- DOWN\nDROP TABLE notes;\n",
        )
        .unwrap();

        let text = output(|out| update(&project, out));
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2, "{text}");
        assert!(lines[0].starts_with("Applying "), "{text}");
        assert!(lines[1].starts_with("Applied "), "{text}");
        assert_eq!(output(|out| update(&project, out)), "No pending migrations.\n");

        let text = output(|out| rollback(&project, out));
        assert!(text.starts_with("Rolled back "), "{text}");
        assert_eq!(
            output(|out| rollback(&project, out)),
            "No migrations to roll back.\n"
        );
    }

    #[test]
    fn failed_update_is_an_error() {
        let (_dir, project) = project();
        init(&project, &mut std::io::sink()).unwrap();
        create(&project, "broken", &mut std::io::sink()).unwrap();
        std::fs::write(only_migration(&project), "-- UP\nNOT SQL AT ALL;\n").unwrap();

        let err = update(&project, &mut std::io::sink()).unwrap_err();
        assert!(err.to_string().contains("was not applied"), "{err:#}");
        assert_eq!(project.open_store().unwrap().pending().unwrap().len(), 1);
    }

    #[test]
    fn status_lists_both_sets_as_json() {
        let (_dir, project) = project();
        init(&project, &mut std::io::sink()).unwrap();
        create(&project, "one", &mut std::io::sink()).unwrap();

        let text = output(|out| status(&project, true, out));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["pending"][0]["name"], "one");
        assert_eq!(value["applied"].as_array().unwrap().len(), 0);

        let text = output(|out| status(&project, false, out));
        assert!(text.contains("Applied (0):"));
        assert!(text.contains("Pending (1):"));
    }

    #[test]
    fn back_to_back_creates_get_distinct_timestamps() {
        let (_dir, project) = project();
        init(&project, &mut std::io::sink()).unwrap();
        create(&project, "first", &mut std::io::sink()).unwrap();
        create(&project, "second", &mut std::io::sink()).unwrap();
        create(&project, "third", &mut std::io::sink()).unwrap();

        let names: Vec<_> = project
            .open_store()
            .unwrap()
            .pending()
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, ["first", "second", "third"]);
        assert_eq!(migration_files(&project).len(), 3);
    }

    #[test]
    fn update_prints_steps_in_the_order_they_happen() {
        let (_dir, project) = project();
        init(&project, &mut std::io::sink()).unwrap();
        create(&project, "empty", &mut std::io::sink()).unwrap();
        create(&project, "real", &mut std::io::sink()).unwrap();

        let files = migration_files(&project);
        std::fs::write(&files[1], "-- UP\nCREATE TABLE real(x);\n").unwrap();

        let text = output(|out| update(&project, out));
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3, "{text}");
        assert!(lines[0].starts_with("Skipped ") && lines[0].contains("_empty"), "{text}");
        assert!(lines[1].starts_with("Applying ") && lines[1].contains("_real"), "{text}");
        assert!(lines[2].starts_with("Applied ") && lines[2].contains("_real"), "{text}");
    }

    #[test]
    fn status_requires_init() {
        let (_dir, project) = project();
        std::fs::create_dir_all(&project.root).unwrap();

        let err = status(&project, false, &mut std::io::sink()).unwrap_err();
        assert!(err.to_string().contains("sqlmig init"));
        assert!(!project.config.database_file.exists());
    }

    #[test]
    fn status_lists_pending_in_timestamp_order() {
        let (_dir, project) = project();
        init(&project, &mut std::io::sink()).unwrap();
        {
            let mut store = project.open_store().unwrap();
            store
                .register_pending(&MigrationRecord::new("20240102", "later"))
                .unwrap();
            store
                .register_pending(&MigrationRecord::new("20240101", "earlier"))
                .unwrap();
        }

        let text = output(|out| status(&project, true, out));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["pending"][0]["name"], "earlier");
        assert_eq!(value["pending"][1]["name"], "later");

        let text = output(|out| status(&project, false, out));
        let earlier = text.find("20240101  earlier").unwrap();
        let later = text.find("20240102  later").unwrap();
        assert!(earlier < later, "{text}");
    }
}
