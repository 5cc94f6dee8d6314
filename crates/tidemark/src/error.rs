//! Error types for the migration engine.

use std::path::PathBuf;

/// Errors that can occur while planning, storing or executing migrations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Database error outside of a migration statement (connection,
    /// transaction control, tracking table).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Another process holds the migration lock.
    #[error("Migration lock is held by another process")]
    LockContention,

    /// A migration statement failed; the unit's transaction was rolled back.
    #[error("Migration {version} failed at statement `{statement}`: {source}")]
    Statement {
        /// Version of the failing unit.
        version: String,
        /// The statement that failed.
        statement: String,
        /// The database error.
        #[source]
        source: sqlx::Error,
    },

    /// A unit still holds a placeholder for a step the planner could not
    /// generate. Nothing was executed.
    #[error("Migration {version} needs a manual step before it can run: {statement}")]
    ManualStepRequired {
        /// Version of the unit.
        version: String,
        /// The unresolved placeholder.
        statement: String,
    },

    /// The rollback target is not a known, applied version.
    #[error("Rollback target '{0}' is not a known applied migration")]
    TargetNotFound(String),

    /// An applied version has no migration unit to roll it back with.
    #[error("Applied migration '{0}' has no known migration unit")]
    MissingUnit(String),

    /// The operation was cancelled.
    #[error("Migration cancelled")]
    Cancelled,

    /// A migration unit failed validation.
    #[error("Invalid migration unit: {0}")]
    InvalidUnit(String),

    /// Two migration units share a version.
    #[error("Duplicate migration version: {0}")]
    DuplicateVersion(String),

    /// Migration file already exists.
    #[error("Migration file already exists: {0}")]
    MigrationExists(PathBuf),

    /// Migration not found.
    #[error("Migration not found: {0}")]
    MigrationNotFound(String),

    /// No migrations directory found.
    #[error("Migrations directory not found: {0}")]
    MigrationsDirNotFound(PathBuf),

    /// Failed to parse migration file.
    #[error("Failed to parse migration file '{path}': {message}")]
    ParseError {
        /// Path to the migration file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// IO error (reading/writing migration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of [`MigrateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The database could not be reached or talked to.
    Connectivity,
    /// The migration lock could not be acquired.
    LockContention,
    /// A migration statement failed.
    Statement,
    /// A rollback target or unit could not be resolved.
    TargetNotFound,
    /// The operation was cancelled.
    Cancelled,
    /// Anything else (validation, files, serialization).
    Other,
}

impl MigrateError {
    /// Returns the error's classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(_) => ErrorKind::Connectivity,
            Self::LockContention => ErrorKind::LockContention,
            Self::Statement { .. } | Self::ManualStepRequired { .. } => ErrorKind::Statement,
            Self::TargetNotFound(_) | Self::MissingUnit(_) => ErrorKind::TargetNotFound,
            Self::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Other,
        }
    }

    /// Returns the version of the unit whose statement failed, if any.
    #[must_use]
    pub fn failed_version(&self) -> Option<&str> {
        match self {
            Self::Statement { version, .. } | Self::ManualStepRequired { version, .. } => {
                Some(version)
            }
            _ => None,
        }
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
