//! Change notification payloads.
//!
//! Triggers publish text payloads of the form `kind|table|op|detail`, with
//! the parts joined by [`DELIMITER`]:
//!
//! - `data_has_changed|table|op|0,2` lists the positions of the matching
//!   conditions in the table's condition list
//! - `data_has_changed|table|op|error; message` reports a condition that
//!   failed to evaluate
//! - `schema_has_changed|command|event|query` reports a DDL statement

use crate::error::{ProtocolError, ProtocolResult};
use std::fmt;
use std::str::FromStr;

/// Separator between payload parts.
pub const DELIMITER: &str = "|$ls$|";

/// Kind tag of a data change payload.
pub const DATA_KIND: &str = "data_has_changed";

/// Kind tag of a schema change payload.
pub const SCHEMA_KIND: &str = "schema_has_changed";

const ERROR_PREFIX: &str = "error";

/// Row operation that fired a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    /// Rows were inserted.
    Insert,
    /// Rows were updated.
    Update,
    /// Rows were deleted.
    Delete,
}

impl ChangeOp {
    /// SQL keyword of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOp {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeOp::Insert),
            "UPDATE" => Ok(ChangeOp::Update),
            "DELETE" => Ok(ChangeOp::Delete),
            other => Err(ProtocolError::InvalidNotification(format!(
                "unknown operation {other:?}"
            ))),
        }
    }
}

/// A parsed change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Rows matching some registered conditions changed.
    Data {
        /// Table name.
        table: String,
        /// Operation.
        op: ChangeOp,
        /// Zero-based positions in the table's condition list.
        condition_ids: Vec<usize>,
    },
    /// A registered condition failed to evaluate.
    ConditionError {
        /// Table name.
        table: String,
        /// Operation.
        op: ChangeOp,
        /// Database error text.
        message: String,
    },
    /// A DDL command ran.
    Schema {
        /// Command tag, such as `ALTER TABLE`.
        command: String,
        /// Event trigger event, such as `ddl_command_end`.
        event: String,
        /// Query text, possibly truncated.
        query: String,
    },
}

impl Notification {
    /// Parses a raw payload.
    pub fn parse(payload: &str) -> ProtocolResult<Self> {
        if payload.is_empty() {
            return Err(ProtocolError::InvalidNotification("empty payload".into()));
        }
        let parts: Vec<&str> = payload.split(DELIMITER).collect();
        match parts.as_slice() {
            [SCHEMA_KIND, command, event, query @ ..] => Ok(Notification::Schema {
                command: (*command).to_string(),
                event: (*event).to_string(),
                query: query.join(DELIMITER),
            }),
            [DATA_KIND, table, op, detail] => {
                let table = (*table).to_string();
                let op = op.parse()?;
                if let Some(message) = detail.strip_prefix(ERROR_PREFIX) {
                    let message = message.trim_start_matches(';').trim().to_string();
                    return Ok(Notification::ConditionError { table, op, message });
                }
                let condition_ids = detail
                    .split(',')
                    .map(|id| {
                        id.trim().parse::<usize>().map_err(|_| {
                            ProtocolError::InvalidNotification(format!(
                                "invalid condition id {id:?} in {payload:?}"
                            ))
                        })
                    })
                    .collect::<ProtocolResult<Vec<_>>>()?;
                Ok(Notification::Data {
                    table,
                    op,
                    condition_ids,
                })
            }
            [kind, ..] => Err(ProtocolError::InvalidNotification(format!(
                "unexpected payload kind {kind:?}"
            ))),
            [] => Err(ProtocolError::InvalidNotification("empty payload".into())),
        }
    }

    /// Renders the payload text.
    pub fn format(&self) -> String {
        match self {
            Notification::Data {
                table,
                op,
                condition_ids,
            } => {
                let ids: Vec<String> = condition_ids.iter().map(ToString::to_string).collect();
                [DATA_KIND, table.as_str(), op.as_str(), ids.join(",").as_str()].join(DELIMITER)
            }
            Notification::ConditionError { table, op, message } => [
                DATA_KIND,
                table.as_str(),
                op.as_str(),
                format!("{ERROR_PREFIX}; {message}").as_str(),
            ]
            .join(DELIMITER),
            Notification::Schema {
                command,
                event,
                query,
            } => [SCHEMA_KIND, command.as_str(), event.as_str(), query.as_str()].join(DELIMITER),
        }
    }

    /// Table the notification is about, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            Notification::Data { table, .. } | Notification::ConditionError { table, .. } => {
                Some(table)
            }
            Notification::Schema { .. } => None,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}
