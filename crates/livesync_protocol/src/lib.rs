//! # LiveSync Protocol
//!
//! Data types shared by the LiveSync engine, server and database backends.
//!
//! This crate provides:
//! - [`Row`] and [`SyncKeys`] for row identity, versions and sync ordering
//! - [`Filter`] for row predicates and their SQL rendering
//! - Wire messages for subscriptions and two-way sync
//! - The change notification payload format
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod filter;
mod messages;
mod notification;
mod row;

pub use error::{ProtocolError, ProtocolResult};
pub use filter::{compare_values, quote_ident, quote_literal, values_equal, Filter, TRUE_CONDITION};
pub use messages::{
    subscription_channel, sync_channel, ClientMessage, PullRange, RowInfo, ServerMessage,
    SubscribeRequest, SyncRange, SyncRequest, SUBSCRIPTION_SUFFIX, SYNC_SUFFIX,
    UNSUBSCRIBE_SUFFIX, UNSYNC_SUFFIX,
};
pub use notification::{ChangeOp, Notification, DATA_KIND, DELIMITER, SCHEMA_KIND};
pub use row::{numeric_value, omit_fields, pick_fields, OrderBy, Row, SyncKeys};
