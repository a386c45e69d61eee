//! Error types for the live sync engine.

use livesync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while serving subscriptions and syncs.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The database or notification connection was lost.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A message or payload had an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client answered a request with an error.
    #[error("client rejected request: {0}")]
    ClientRejected(String),

    /// The access rules do not allow the operation.
    #[error("rule violation: {0}")]
    RuleViolation(String),

    /// A table query failed.
    #[error("query failed: {0}")]
    Query(String),

    /// The destination connection is gone.
    #[error("destination {connection} is no longer connected")]
    OrphanedDestination {
        /// Connection id.
        connection: String,
    },

    /// The database trigger could not be created.
    #[error("could not create trigger on {table} for {condition}: {message}")]
    TriggerCreation {
        /// Table name.
        table: String,
        /// Trigger condition.
        condition: String,
        /// Underlying error.
        message: String,
    },

    /// A client round trip took too long.
    #[error("client request timed out")]
    Timeout,

    /// Configuration or rules are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The table does not exist or is not exposed.
    #[error("unknown table {0:?}")]
    UnknownTable(String),

    /// A subscription or sync does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The subscription or sync was closed.
    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Creates a rule violation error.
    pub fn rule_violation(message: impl Into<String>) -> Self {
        Self::RuleViolation(message.into())
    }

    /// Returns true if a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionLost(_) | SyncError::Timeout | SyncError::Query(_)
        )
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::ConnectionLost("reset".into()).is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::query("deadlock").is_retryable());
        assert!(!SyncError::rule_violation("no insert").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::UnknownTable("t".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::TriggerCreation {
            table: "items".into(),
            condition: "TRUE".into(),
            message: "permission denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "could not create trigger on items for TRUE: permission denied"
        );

        let err: SyncError = ProtocolError::malformed("bad").into();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
