use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";
pub const DEFAULT_DATABASE_FILE: &str = "database.db";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Settings for one migration project. Relative paths are resolved against
/// the project root by [`ProjectConfig::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub migrations_dir: PathBuf,
    pub database_file: PathBuf,
    /// How long to wait for a conflicting lock before giving up.
    pub busy_timeout_ms: u64,
    pub journal_mode: JournalMode,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from(DEFAULT_MIGRATIONS_DIR),
            database_file: PathBuf::from(DEFAULT_DATABASE_FILE),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: JournalMode::default(),
        }
    }
}

impl ProjectConfig {
    /// Make `migrations_dir` and `database_file` absolute-or-root-relative.
    pub fn resolve(mut self, root: &Path) -> Self {
        if self.migrations_dir.is_relative() {
            self.migrations_dir = root.join(&self.migrations_dir);
        }
        if self.database_file.is_relative() {
            self.database_file = root.join(&self.database_file);
        }
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// SQLite journal mode applied when the database is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
    Truncate,
    Memory,
}

impl JournalMode {
    pub fn as_pragma(&self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::Memory => "MEMORY",
        }
    }
}
