//! Collaborator interfaces for table access and access rules.
//!
//! The engine never builds SQL itself. It talks to tables through
//! [`TableHandle`], which a backend implements on top of its own query layer.
//! Handles are expected to apply row-level authorization already.

use crate::error::SyncResult;
use async_trait::async_trait;
use livesync_protocol::{Filter, OrderBy, Row, SyncKeys};
use std::sync::Arc;
use std::time::Duration;

/// Options of a `find` query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindParams {
    /// Columns to return. Empty returns all columns.
    pub select: Vec<String>,
    /// Sort order.
    pub order_by: Vec<OrderBy>,
    /// Maximum number of rows.
    pub limit: Option<usize>,
    /// Rows to skip.
    pub offset: usize,
}

impl FindParams {
    /// Creates empty find options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the selected columns.
    pub fn with_select(mut self, select: Vec<String>) -> Self {
        self.select = select;
        self
    }

    /// Sets the sort order.
    pub fn with_order_by(mut self, order_by: Vec<OrderBy>) -> Self {
        self.order_by = order_by;
        self
    }

    /// Sets the row limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the row offset.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Query access to one table.
#[async_trait]
pub trait TableHandle: Send + Sync {
    /// Table name.
    fn name(&self) -> &str;

    /// Returns rows matching `filter`.
    async fn find(&self, filter: &Filter, params: &FindParams) -> SyncResult<Vec<Row>>;

    /// Counts rows matching `filter`.
    async fn count(&self, filter: &Filter) -> SyncResult<u64>;

    /// Inserts rows, returning how many were inserted.
    async fn insert(&self, rows: Vec<Row>) -> SyncResult<u64>;

    /// Sets `changes` on rows matching `filter`, returning how many changed.
    async fn update(&self, filter: &Filter, changes: Row) -> SyncResult<u64>;

    /// Deletes rows matching `filter`, returning how many were deleted.
    async fn delete(&self, filter: &Filter) -> SyncResult<u64>;

    /// Starts a transaction on this table.
    async fn begin(&self) -> SyncResult<Box<dyn TableTransaction>>;
}

/// A transaction on one table. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait TableTransaction: Send {
    /// Returns rows matching `filter` as seen by this transaction.
    async fn find(&mut self, filter: &Filter, params: &FindParams) -> SyncResult<Vec<Row>>;

    /// Inserts rows.
    async fn insert(&mut self, rows: Vec<Row>) -> SyncResult<u64>;

    /// Sets `changes` on rows matching `filter`.
    async fn update(&mut self, filter: &Filter, changes: Row) -> SyncResult<u64>;

    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> SyncResult<()>;
}

/// Resolves table handles by name.
pub trait Database: Send + Sync {
    /// Returns the handle of `name`, or `None` if the table is not exposed.
    fn table(&self, name: &str) -> Option<Arc<dyn TableHandle>>;
}

/// Sync settings of a table.
#[derive(Debug, Clone)]
pub struct SyncRules {
    /// Identity and version columns.
    pub keys: SyncKeys,
    /// Whether client deletes and reconciliation deletes are allowed.
    pub allow_delete: bool,
    /// Minimum spacing between passes.
    pub throttle: Option<Duration>,
    /// Rows per page.
    pub batch_size: Option<usize>,
}

impl SyncRules {
    /// Creates sync rules for `keys`.
    pub fn new(keys: SyncKeys) -> Self {
        Self {
            keys,
            allow_delete: false,
            throttle: None,
            batch_size: None,
        }
    }

    /// Allows deletes.
    pub fn with_allow_delete(mut self, allow: bool) -> Self {
        self.allow_delete = allow;
        self
    }

    /// Sets the pass throttle.
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Sets the page size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }
}

/// Access rules of one table for one connection, as resolved by the
/// application's rule layer.
#[derive(Debug, Clone, Default)]
pub struct TableRules {
    /// Rows may be read.
    pub select: bool,
    /// Rows may be inserted.
    pub insert: bool,
    /// Rows may be updated.
    pub update: bool,
    /// Rows may be deleted.
    pub delete: bool,
    /// Minimum spacing between subscription pushes.
    pub subscribe_throttle: Option<Duration>,
    /// Sync settings. Tables without them cannot be synced.
    pub sync: Option<SyncRules>,
}

impl TableRules {
    /// Rules granting nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Rules granting read access only.
    pub fn read_only() -> Self {
        Self {
            select: true,
            ..Self::default()
        }
    }

    /// Rules granting every operation.
    pub fn all() -> Self {
        Self {
            select: true,
            insert: true,
            update: true,
            delete: true,
            ..Self::default()
        }
    }

    /// Sets the subscription throttle.
    pub fn with_subscribe_throttle(mut self, throttle: Duration) -> Self {
        self.subscribe_throttle = Some(throttle);
        self
    }

    /// Sets the sync settings.
    pub fn with_sync(mut self, sync: SyncRules) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Resolves the effective subscription throttle.
    ///
    /// The rule throttle replaces `default`. A client throttle is only
    /// honored when it is not shorter than that.
    pub fn resolve_subscribe_throttle(
        &self,
        default: Duration,
        requested: Option<Duration>,
    ) -> Duration {
        let floor = self.subscribe_throttle.unwrap_or(default);
        match requested {
            Some(requested) if requested >= floor => requested,
            _ => floor,
        }
    }
}
