//! Wire messages exchanged on connection channels.
//!
//! Every message is a JSON object with camelCase keys. The variant is
//! identified by which top-level key is present, so the enums here are
//! untagged and their variant order matters for decoding.

use crate::error::{ProtocolError, ProtocolResult};
use crate::filter::Filter;
use crate::row::Row;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Suffix of a subscription channel.
pub const SUBSCRIPTION_SUFFIX: &str = "m.sub";
/// Suffix of a sync channel.
pub const SYNC_SUFFIX: &str = "sync";
/// Appended to a subscription channel to form its unsubscribe channel.
pub const UNSUBSCRIBE_SUFFIX: &str = "unsubscribe";
/// Appended to a sync channel to form its unsync channel.
pub const UNSYNC_SUFFIX: &str = "unsync";

/// Range of rows the server asks the client to describe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRange {
    /// Lower bound on the synced field, inclusive.
    #[serde(default)]
    pub from_synced: Option<f64>,
    /// Upper bound on the synced field, inclusive.
    #[serde(default)]
    pub to_synced: Option<f64>,
    /// Which row to report as the last one, counted back from the end of the
    /// range. Zero means the actual last row.
    #[serde(default)]
    pub end_offset: Option<u64>,
}

/// Page of client rows the server asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRange {
    /// Lower bound on the synced field, inclusive.
    pub from_synced: f64,
    /// Number of rows to skip.
    pub offset: u64,
    /// Maximum number of rows to return.
    pub limit: u64,
}

/// First row, last row and count of a row range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowInfo {
    /// First row in sync order.
    #[serde(default)]
    pub first_row: Option<Row>,
    /// Last row in sync order, or the row at the requested end offset.
    #[serde(default)]
    pub last_row: Option<Row>,
    /// Number of rows in the range.
    #[serde(default)]
    pub count: u64,
}

impl RowInfo {
    /// True if the range holds no rows.
    pub fn is_empty(&self) -> bool {
        self.first_row.is_none() && self.last_row.is_none()
    }
}

/// A message sent by the server on a connection channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Asks the client for row info over a range.
    SyncRequest {
        /// Requested range.
        #[serde(rename = "onSyncRequest")]
        on_sync_request: SyncRange,
    },
    /// Asks the client for a page of rows.
    PullRequest {
        /// Requested page.
        #[serde(rename = "onPullRequest")]
        on_pull_request: PullRange,
    },
    /// Sync rows pushed to the client; acknowledged with `{ok: true}`.
    Push {
        /// Rows the client lacks or holds at an older version.
        data: Vec<Row>,
        /// True on the final push of a reconciliation pass.
        #[serde(rename = "isFullySynced")]
        is_fully_synced: bool,
        /// Generic error notice.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Subscription result set.
    Data {
        /// Current rows.
        data: Vec<Row>,
    },
    /// Subscription error notice.
    Err {
        /// Error text or object.
        err: Value,
    },
}

impl ServerMessage {
    /// Builds a sync request.
    pub fn sync_request(range: SyncRange) -> Self {
        Self::SyncRequest {
            on_sync_request: range,
        }
    }

    /// Builds a pull request.
    pub fn pull_request(from_synced: f64, offset: u64, limit: u64) -> Self {
        Self::PullRequest {
            on_pull_request: PullRange {
                from_synced,
                offset,
                limit,
            },
        }
    }

    /// Builds a sync push.
    pub fn push(data: Vec<Row>, is_fully_synced: bool, error: Option<String>) -> Self {
        Self::Push {
            data,
            is_fully_synced,
            error,
        }
    }

    /// Builds a subscription error notice.
    pub fn err(message: impl Into<String>) -> Self {
        Self::Err {
            err: Value::String(message.into()),
        }
    }

    /// Encodes to a JSON value.
    pub fn to_value(&self) -> ProtocolResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes from a JSON value.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        decode(value, "server message")
    }
}

/// A message sent by the client, either as a reply to a server request or
/// unprompted on a sync channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    /// Row info, as a reply to a sync request or as a client-started pass.
    SyncInfo {
        /// Row info of the client range.
        #[serde(rename = "onSyncRequest")]
        on_sync_request: RowInfo,
    },
    /// Rows, as a reply to a pull request or as client writes.
    Data {
        /// Client rows.
        data: Vec<Row>,
    },
    /// Rows the client deleted.
    Deleted {
        /// Deleted rows; only id fields are read.
        deleted: Vec<Row>,
    },
    /// Acknowledges a push.
    Ack {
        /// Must be true.
        ok: bool,
    },
    /// The client failed to answer.
    Error {
        /// Error text or object.
        #[serde(alias = "err")]
        error: Value,
    },
}

impl ClientMessage {
    /// Builds a positive push acknowledgement.
    pub fn ack() -> Self {
        Self::Ack { ok: true }
    }

    /// Encodes to a JSON value.
    pub fn to_value(&self) -> ProtocolResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes from a JSON value.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        decode(value, "client message")
    }

    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncInfo { .. } => "onSyncRequest",
            Self::Data { .. } => "data",
            Self::Deleted { .. } => "deleted",
            Self::Ack { .. } => "ok",
            Self::Error { .. } => "error",
        }
    }
}

/// Parameters of a subscribe request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Table name.
    pub table: String,
    /// Row filter.
    #[serde(default)]
    pub filter: Filter,
    /// Columns to return; empty means all columns.
    #[serde(default)]
    pub select: Vec<String>,
    /// Requested minimum push spacing in milliseconds.
    #[serde(default)]
    pub throttle: Option<u64>,
}

/// Parameters of a sync request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Table name.
    pub table: String,
    /// Row filter.
    #[serde(default)]
    pub filter: Filter,
    /// Columns pushed to the client; empty means all columns.
    #[serde(default)]
    pub select: Vec<String>,
    /// Requested minimum spacing between passes in milliseconds.
    #[serde(default)]
    pub throttle: Option<u64>,
}

/// Channel identifier of a subscription.
pub fn subscription_channel(
    prefix: &str,
    table: &str,
    filter: &Filter,
    select: &[String],
) -> ProtocolResult<String> {
    Ok(format!(
        "{prefix}.{table}.{}.{}.{SUBSCRIPTION_SUFFIX}",
        serde_json::to_string(filter)?,
        serde_json::to_string(select)?
    ))
}

/// Channel identifier of a sync.
pub fn sync_channel(prefix: &str, table: &str, filter: &Filter) -> ProtocolResult<String> {
    Ok(format!(
        "{prefix}.{table}.{}.{SYNC_SUFFIX}",
        serde_json::to_string(filter)?
    ))
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> ProtocolResult<T> {
    if !value.is_object() {
        return Err(ProtocolError::malformed(format!(
            "{what} must be an object, got {value}"
        )));
    }
    serde_json::from_value(value.clone())
        .map_err(|e| ProtocolError::malformed(format!("unexpected {what} {value}: {e}")))
}
