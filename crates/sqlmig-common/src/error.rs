use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The step of a migration transaction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    /// Opening the transaction and taking the exclusive lock.
    Begin,
    /// Running the migration's own SQL.
    Execute,
    /// Moving the record between the pending and applied tables.
    Bookkeeping,
    Commit,
}

impl fmt::Display for TxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            TxStage::Begin => "lock acquisition",
            TxStage::Execute => "sql execution",
            TxStage::Bookkeeping => "bookkeeping",
            TxStage::Commit => "commit",
        };
        f.write_str(stage)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("migrations directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("migration file not found: {}", .0.display())]
    MigrationFileNotFound(PathBuf),

    #[error("failed to read migration file {}: {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed migration {}: {reason}", path.display())]
    MalformedMigration { path: PathBuf, reason: String },

    #[error("migration {migration} failed during {stage}: {message}")]
    Transaction {
        migration: String,
        stage: TxStage,
        message: String,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid migration name: {0}")]
    InvalidName(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn transaction(migration: impl Into<String>, stage: TxStage, err: impl fmt::Display) -> Self {
        Error::Transaction {
            migration: migration.into(),
            stage,
            message: err.to_string(),
        }
    }
}
