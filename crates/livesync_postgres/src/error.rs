//! Error types for the PostgreSQL backend.

use livesync_engine::SyncError;
use thiserror::Error;

/// Result type for PostgreSQL backend operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur in the PostgreSQL backend.
#[derive(Error, Debug)]
pub enum PgError {
    /// The database returned an error or could not be reached.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A name cannot be used in generated SQL.
    #[error("invalid identifier {0:?}: use lowercase letters, digits and underscores")]
    InvalidIdentifier(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The bookkeeping schema is missing.
    #[error("schema {0:?} is not installed, run the install SQL first")]
    NotInstalled(String),
}

impl PgError {
    /// Returns true if the connection, not the statement, failed.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            PgError::Sqlx(
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            )
        )
    }
}

impl From<PgError> for SyncError {
    fn from(err: PgError) -> Self {
        if err.is_connection_error() {
            return SyncError::ConnectionLost(err.to_string());
        }
        match err {
            PgError::InvalidIdentifier(_)
            | PgError::InvalidConfig(_)
            | PgError::NotInstalled(_) => SyncError::InvalidConfig(err.to_string()),
            PgError::Sqlx(_) => SyncError::query(err.to_string()),
        }
    }
}
