//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or parsing protocol data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A message did not have the expected shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A notification payload could not be parsed.
    #[error("invalid notification payload: {0}")]
    InvalidNotification(String),

    /// A row is missing a field required for syncing.
    #[error("row is missing field {field:?}")]
    MissingField {
        /// Name of the missing field.
        field: String,
    },

    /// The synced field holds a value that is not a finite number.
    #[error("synced field {field:?} is not numeric: {value}")]
    NonNumericSynced {
        /// Name of the synced field.
        field: String,
        /// The offending value, rendered as JSON.
        value: String,
    },

    /// Sync keys were declared incorrectly.
    #[error("invalid sync keys: {0}")]
    InvalidKeys(String),
}

impl ProtocolError {
    /// Creates a malformed message error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}
