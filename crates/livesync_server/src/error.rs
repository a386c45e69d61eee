//! Error types for the sync server.

use livesync_engine::{SyncError, INTERNAL_ERROR_NOTICE};
use livesync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The connection may not access the table.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// No subscription or sync listens on the channel.
    #[error("unknown channel {0:?}")]
    UnknownChannel(String),

    /// Too many open connections.
    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),

    /// The connection id is already registered.
    #[error("connection {0} is already registered")]
    DuplicateConnection(String),

    /// A message could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The engine failed.
    #[error(transparent)]
    Engine(#[from] SyncError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if the client caused the error.
    pub fn is_client_error(&self) -> bool {
        match self {
            ServerError::InvalidRequest(_)
            | ServerError::NotAuthorized(_)
            | ServerError::UnknownChannel(_)
            | ServerError::ConnectionLimit(_)
            | ServerError::DuplicateConnection(_)
            | ServerError::Protocol(_) => true,
            ServerError::Engine(e) => matches!(
                e,
                SyncError::Protocol(_)
                    | SyncError::RuleViolation(_)
                    | SyncError::UnknownTable(_)
                    | SyncError::NotFound(_)
                    | SyncError::InvalidConfig(_)
            ),
            ServerError::Internal(_) => false,
        }
    }

    /// Returns true if the server is at fault.
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Text sent to the client. Server faults are replaced by a generic notice.
    pub fn client_notice(&self) -> String {
        if self.is_client_error() {
            self.to_string()
        } else {
            INTERNAL_ERROR_NOTICE.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
        assert!(ServerError::from(SyncError::UnknownTable("t".into())).is_client_error());
        assert!(ServerError::from(SyncError::rule_violation("no sync")).is_client_error());
        assert!(ServerError::from(SyncError::Timeout).is_server_error());
        assert!(ServerError::from(SyncError::query("syntax")).is_server_error());
    }

    #[test]
    fn notices_hide_server_faults() {
        let err = ServerError::from(SyncError::query("relation \"secret\" does not exist"));
        assert_eq!(err.client_notice(), INTERNAL_ERROR_NOTICE);

        let err = ServerError::UnknownChannel("x.sync".into());
        assert!(err.client_notice().contains("x.sync"));
    }
}
