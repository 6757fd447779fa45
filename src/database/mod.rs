//! Backup, recovery and delivery for the SQLite database file

pub mod storage;

pub mod backup;
pub mod backup_naming;
pub mod delivery;
pub mod integrity;
pub mod restore;
pub mod scheduler;
pub mod snapshot;
pub mod status;

/// Database error type for backup/restore operations
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backup not found")]
    BackupNotFound,

    #[error("AWS error: {0}")]
    Aws(String),

    #[error("Source database does not exist: {0}")]
    SourceMissing(String),

    #[error("Snapshot failed verification: {0}")]
    InvalidSnapshot(String),

    #[error("A backup run is already in progress")]
    AlreadyRunning,

    #[error("Could not produce a usable database: {0}")]
    RestoreExhausted(String),
}

impl From<sqlx::Error> for BackupError {
    fn from(error: sqlx::Error) -> Self {
        BackupError::Sqlite(error.to_string())
    }
}

/// Result type for database operations
pub type Result<T> = std::result::Result<T, BackupError>;
