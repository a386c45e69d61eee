//! Two-way sync replication.
//!
//! A [`SyncSession`] keeps one client's cached copy of a filtered table in
//! step with the server. Rows carry identity columns and a numeric synced
//! column that only grows. A reconciliation pass finds the point where the
//! two sides diverge and then exchanges pages from there:
//!
//! 1. find the divergence point (`last_synced`)
//! 2. page through both sides from that point (`sync_batch`), applying
//!    client rows to the server and pushing newer server rows to the client
//! 3. finish with an empty push flagged `isFullySynced`
//!
//! Client writes go through a [`WriteBuffer`] and are applied in batches.

use crate::client::ClientChannel;
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::state::{SyncAction, SyncEvent, SyncMachine, SyncPhase};
use crate::table::{FindParams, TableHandle, TableRules};
use crate::trigger::TriggerKey;
use crate::wal::WriteBuffer;
use livesync_protocol::{
    ClientMessage, Filter, Row, RowInfo, ServerMessage, SyncKeys, SyncRange,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Notice pushed to the client when a server query fails mid-pass.
pub const INTERNAL_ERROR_NOTICE: &str = "Internal error. Check server logs";

/// The probe for a common prefix only runs on ranges larger than this.
const PROBE_MIN_ROWS: u64 = 5;

/// What started a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassSource {
    /// A change notification for the sync's trigger.
    Trigger,
    /// The client asked for a pass.
    Client,
    /// The pass that follows a write-buffer flush.
    Flush,
    /// A deferred request replayed by the retry timer.
    Retry,
}

impl PassSource {
    /// True for passes the client asked for. Those always fetch fresh
    /// client row info instead of trusting the last synced row.
    pub fn is_client_initiated(&self) -> bool {
        matches!(self, PassSource::Client)
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    /// Divergence point. `None` means both sides already matched.
    pub from_synced: Option<f64>,
    /// Client rows pulled.
    pub pulled: usize,
    /// Client rows inserted on the server.
    pub inserted: u64,
    /// Client rows that updated server rows.
    pub updated: u64,
    /// Client rows refused by rules or validation.
    pub rejected: u64,
    /// Server rows deleted.
    pub deleted: u64,
    /// Server rows pushed to the client.
    pub pushed: usize,
    /// Synced value of the last row seen.
    pub last_synced: Option<f64>,
}

impl PassReport {
    /// True if the pass found nothing to exchange.
    pub fn is_converged(&self) -> bool {
        self.from_synced.is_none()
    }
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    /// Rows inserted.
    pub inserted: u64,
    /// Rows updated.
    pub updated: u64,
    /// Rows refused by rules or validation.
    pub rejected: u64,
    /// Rows received.
    pub total: u64,
}

/// Parameters of a new sync.
pub struct SessionParams {
    /// Channel the client talks on.
    pub channel: String,
    /// Trigger the sync depends on.
    pub trigger: TriggerKey,
    /// Table handle.
    pub table: Arc<dyn TableHandle>,
    /// Client connection.
    pub client: Arc<dyn ClientChannel>,
    /// Row filter.
    pub filter: Filter,
    /// Columns pushed to the client. Empty means all columns.
    pub select: Vec<String>,
    /// Access rules, which must include sync rules.
    pub rules: TableRules,
    /// Throttle requested by the client.
    pub throttle: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
struct Progress {
    last_row: Option<Row>,
    last_synced: Option<f64>,
}

/// One client's sync of one filtered table.
pub struct SyncSession {
    channel: String,
    trigger: TriggerKey,
    table: Arc<dyn TableHandle>,
    client: Arc<dyn ClientChannel>,
    filter: Filter,
    select: Vec<String>,
    keys: SyncKeys,
    rules: TableRules,
    allow_delete: bool,
    batch_size: usize,
    throttle: Duration,
    client_timeout: Option<Duration>,
    machine: Mutex<SyncMachine>,
    progress: Mutex<Progress>,
    wal: Mutex<WriteBuffer>,
    retry: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SyncSession {
    /// Creates a sync. Fails if the rules carry no sync settings or do not
    /// allow reading.
    pub fn new(params: SessionParams, config: &EngineConfig) -> SyncResult<Arc<Self>> {
        let SessionParams {
            channel,
            trigger,
            table,
            client,
            filter,
            select,
            rules,
            throttle,
        } = params;

        if !rules.select {
            return Err(SyncError::rule_violation(format!(
                "select is not allowed on {}",
                table.name()
            )));
        }
        let sync_rules = rules.sync.clone().ok_or_else(|| {
            SyncError::rule_violation(format!("table {} has no sync rules", table.name()))
        })?;

        let keys = sync_rules.keys.clone();
        let batch_size = sync_rules.batch_size.unwrap_or(config.batch_size).max(1);
        let throttle = throttle
            .unwrap_or_default()
            .max(sync_rules.throttle.unwrap_or_default());
        let select = if select.is_empty() {
            select
        } else {
            let mut select = select;
            for field in keys.sync_fields() {
                if !select.contains(&field) {
                    select.push(field);
                }
            }
            select
        };
        let wal = WriteBuffer::new(keys.clone(), batch_size, config.history_age);

        Ok(Arc::new(Self {
            channel,
            trigger,
            table,
            client,
            filter,
            select,
            keys,
            allow_delete: sync_rules.allow_delete,
            rules,
            batch_size,
            throttle,
            client_timeout: config.client_timeout,
            machine: Mutex::new(SyncMachine::new()),
            progress: Mutex::new(Progress::default()),
            wal: Mutex::new(wal),
            retry: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Connection id of the client.
    pub fn connection_id(&self) -> &str {
        self.client.connection_id()
    }

    /// Trigger the sync depends on.
    pub fn trigger(&self) -> &TriggerKey {
        &self.trigger
    }

    /// Sync keys.
    pub fn keys(&self) -> &SyncKeys {
        &self.keys
    }

    /// Rows per page.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Minimum spacing between passes.
    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    /// Current phase.
    pub fn phase(&self) -> SyncPhase {
        self.machine.lock().phase()
    }

    /// Last row seen by a pass or flush.
    pub fn last_row(&self) -> Option<Row> {
        self.progress.lock().last_row.clone()
    }

    /// Synced value of the last row seen.
    pub fn last_synced_value(&self) -> Option<f64> {
        self.progress.lock().last_synced
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops the sync. Running passes end at their next step.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(retry) = self.retry.lock().take() {
            retry.abort();
        }
        debug!(channel = %self.channel, "sync closed");
    }

    fn can_delete(&self) -> bool {
        self.allow_delete && self.rules.delete
    }

    fn on_event(&self, event: SyncEvent) -> SyncAction {
        self.machine.lock().handle(event)
    }

    // ---------------------------------------------------------------------
    // Entry points
    // ---------------------------------------------------------------------

    /// Runs a reconciliation pass, or defers it if the sync is busy.
    ///
    /// Returns `None` when the request was deferred.
    pub async fn reconcile(
        self: &Arc<Self>,
        source: PassSource,
        hint: Option<RowInfo>,
    ) -> SyncResult<Option<PassReport>> {
        if self.is_closed() {
            return Err(SyncError::Cancelled);
        }
        let action = self.on_event(SyncEvent::PassRequested);
        if action != SyncAction::StartPass {
            debug!(channel = %self.channel, ?source, "sync busy, pass deferred");
        }
        self.drive(action, source, hint).await
    }

    /// Starts a pass in the background.
    pub fn request_pass(self: &Arc<Self>, source: PassSource) {
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.reconcile(source, None).await {
                log_pass_error(&session.channel, &e);
            }
        });
    }

    /// Buffers client writes and returns without waiting for them.
    ///
    /// The flush runs in the background, or right after the pass that is
    /// running now. Rows that arrive while a flush waits join its batches.
    pub fn client_data(self: &Arc<Self>, rows: Vec<Row>) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::Cancelled);
        }
        let pending = self.wal.lock().add_rows(rows);
        debug!(channel = %self.channel, pending, "client rows buffered");
        let action = self.on_event(SyncEvent::FlushRequested);
        if action == SyncAction::Nothing {
            return Ok(());
        }
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.drive(action, PassSource::Flush, None).await {
                log_pass_error(&session.channel, &e);
            }
        });
        Ok(())
    }

    /// Deletes rows the client deleted, then reconciles.
    pub async fn client_deleted(self: &Arc<Self>, rows: Vec<Row>) -> SyncResult<u64> {
        let deleted = self.delete(&rows).await?;
        self.reconcile(PassSource::Client, None).await?;
        Ok(deleted)
    }

    /// Handles a message the client sent on the sync channel.
    pub async fn handle_client_message(self: &Arc<Self>, message: ClientMessage) -> SyncResult<()> {
        match message {
            ClientMessage::SyncInfo { on_sync_request } => self
                .reconcile(PassSource::Client, Some(on_sync_request))
                .await
                .map(|_| ()),
            ClientMessage::Data { data } if data.is_empty() => {
                self.reconcile(PassSource::Client, None).await.map(|_| ())
            }
            ClientMessage::Data { data } => self.client_data(data),
            ClientMessage::Deleted { deleted } => self.client_deleted(deleted).await.map(|_| ()),
            other => Err(SyncError::protocol(format!(
                "unexpected {} request, need data or onSyncRequest",
                other.kind()
            ))),
        }
    }

    /// Performs `action` and every action that follows from it.
    ///
    /// Returns the report of the first pass run, if any.
    async fn drive(
        self: &Arc<Self>,
        mut action: SyncAction,
        mut source: PassSource,
        mut hint: Option<RowInfo>,
    ) -> SyncResult<Option<PassReport>> {
        let mut first: Option<SyncResult<PassReport>> = None;

        loop {
            if self.is_closed() {
                break;
            }
            action = match action {
                SyncAction::StartPass => {
                    let result = self.run_pass(source, hint.take()).await;
                    if first.is_none() {
                        first = Some(result);
                    } else if let Err(e) = result {
                        log_pass_error(&self.channel, &e);
                    }
                    self.on_event(SyncEvent::PassFinished)
                }
                SyncAction::StartFlush => {
                    self.flush().await;
                    source = PassSource::Flush;
                    self.on_event(SyncEvent::FlushFinished)
                }
                SyncAction::ArmRetry => {
                    self.arm_retry();
                    break;
                }
                SyncAction::Nothing => break,
            };
        }

        match first {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }

    fn arm_retry(self: &Arc<Self>) {
        let session: Weak<Self> = Arc::downgrade(self);
        let throttle = self.throttle;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(throttle).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.is_closed() {
                return;
            }
            let action = session.on_event(SyncEvent::RetryElapsed);
            if let Err(e) = session.drive(action, PassSource::Retry, None).await {
                log_pass_error(&session.channel, &e);
            }
        });
        *self.retry.lock() = Some(handle);
    }

    // ---------------------------------------------------------------------
    // Reconciliation
    // ---------------------------------------------------------------------

    async fn run_pass(&self, source: PassSource, hint: Option<RowInfo>) -> SyncResult<PassReport> {
        let mut report = PassReport::default();

        let from = match self.last_row() {
            Some(last_row) if !source.is_client_initiated() => {
                let server = self.server_row_info(None, None).await?;
                if self.keys.fully_match(Some(&last_row), server.last_row.as_ref()) {
                    None
                } else {
                    Some(self.last_synced_value().unwrap_or(0.0))
                }
            }
            _ => self.last_synced(hint).await?,
        };
        report.from_synced = from;

        if let Some(from) = from {
            self.sync_batch(from, &mut report).await?;
        }

        self.push(Vec::new(), true, None).await?;
        report.last_synced = self.last_synced_value();

        debug!(
            channel = %self.channel,
            ?source,
            from_synced = ?report.from_synced,
            pulled = report.pulled,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            pushed = report.pushed,
            "sync pass finished"
        );
        Ok(report)
    }

    /// Finds the synced value from which client and server diverge.
    ///
    /// Returns `None` when both sides are empty or end with the same row.
    /// `hint` is client row info the client sent along with its request.
    pub async fn last_synced(&self, hint: Option<RowInfo>) -> SyncResult<Option<f64>> {
        let client = match hint {
            Some(hint) => hint,
            None => self.client_row_info(SyncRange::default()).await?,
        };
        let server = self.server_row_info(None, None).await?;
        let keys = &self.keys;
        let synced = |row: &Option<Row>| row.as_ref().and_then(|r| keys.synced_value(r));

        if (client.first_row.is_none() && server.first_row.is_none())
            || keys.fully_match(client.last_row.as_ref(), server.last_row.as_ref())
        {
            return Ok(None);
        }

        if !keys.fully_match(client.first_row.as_ref(), server.first_row.as_ref()) {
            let point = match (synced(&client.first_row), synced(&server.first_row)) {
                (Some(c), Some(s)) => c.min(s),
                (Some(v), None) | (None, Some(v)) => v,
                (None, None) => 0.0,
            };
            return Ok(Some(point));
        }

        // First rows match: start from the lower of the two last rows, then
        // walk back through the client range looking for a row the server
        // holds at the same version.
        let mut result = match (synced(&client.last_row), synced(&server.last_row)) {
            (Some(c), Some(s)) => c.min(s),
            _ => [synced(&client.first_row), synced(&server.first_row)]
                .into_iter()
                .flatten()
                .fold(f64::INFINITY, f64::min),
        };
        if !result.is_finite() {
            result = 0.0;
        }

        let min_count = client.count.min(server.count);
        let mut end_offset: u64 = 1;
        let mut step: u64 = 0;
        while min_count > PROBE_MIN_ROWS && end_offset < min_count {
            let probe = self
                .client_row_info(SyncRange {
                    from_synced: None,
                    to_synced: Some(result),
                    end_offset: Some(end_offset),
                })
                .await?;

            let on_server = match probe.last_row {
                Some(row) if keys.validate(&row).is_ok() => {
                    let filter = self.filter.clone().and_also(keys.exact_filter(&row));
                    let params = FindParams::new()
                        .with_select(keys.sync_fields())
                        .with_limit(1);
                    self.table.find(&filter, &params).await?.into_iter().next()
                }
                _ => None,
            };

            match on_server.and_then(|row| keys.synced_value(&row)) {
                Some(found) => {
                    result = found;
                    end_offset = min_count;
                }
                None => {
                    end_offset += 1 + step * if step > 4 { 2 } else { 1 };
                }
            }
            step += 1;
        }

        Ok(Some(result))
    }

    /// Exchanges pages from `from_synced` until a server page comes back short.
    pub async fn sync_batch(&self, from_synced: f64, report: &mut PassReport) -> SyncResult<()> {
        let mut offset: u64 = 0;

        loop {
            if self.is_closed() {
                return Err(SyncError::Cancelled);
            }

            let client_rows = self.client_page(from_synced, offset).await?;
            report.pulled += client_rows.len();
            if !client_rows.is_empty() {
                let upserted = self.upsert(&client_rows).await?;
                report.inserted += upserted.inserted;
                report.updated += upserted.updated;
                report.rejected += upserted.rejected;
            }

            let mut server_rows = self.server_page_or_notify(from_synced, offset).await?;

            if self.can_delete() && !client_rows.is_empty() {
                let stale = self.absent_from_client(&server_rows, &client_rows);
                if !stale.is_empty() {
                    report.deleted += self.delete(&stale).await?;
                    server_rows = self.server_page_or_notify(from_synced, offset).await?;
                }
            }

            let for_client = self.rows_for_client(&server_rows, &client_rows);
            if !for_client.is_empty() {
                report.pushed += for_client.len();
                self.push(for_client, false, None).await?;
            }

            if !server_rows.is_empty() {
                self.advance(&server_rows);
            }

            offset += server_rows.len() as u64;
            if server_rows.len() < self.batch_size {
                return Ok(());
            }
        }
    }

    /// Server rows the client lacks or holds at a lower version, minus rows
    /// the client itself wrote moments ago.
    fn rows_for_client(&self, server_rows: &[Row], client_rows: &[Row]) -> Vec<Row> {
        let now = Instant::now();
        let wal = self.wal.lock();
        server_rows
            .iter()
            .filter(|s| {
                !client_rows.iter().any(|c| {
                    self.keys.ids_match(c, s)
                        && self.keys.synced_value(c) >= self.keys.synced_value(s)
                })
            })
            .filter(|s| !wal.is_in_history(s, now))
            .cloned()
            .collect()
    }

    /// Server rows inside the client page's synced range that the page lacks.
    fn absent_from_client(&self, server_rows: &[Row], client_rows: &[Row]) -> Vec<Row> {
        let lo = client_rows.first().and_then(|r| self.keys.synced_value(r));
        let hi = client_rows.last().and_then(|r| self.keys.synced_value(r));
        let (Some(lo), Some(hi)) = (lo, hi) else {
            return Vec::new();
        };
        server_rows
            .iter()
            .filter(|s| {
                self.keys
                    .synced_value(s)
                    .map_or(false, |v| v >= lo && v <= hi)
            })
            .filter(|s| !client_rows.iter().any(|c| self.keys.ids_match(c, s)))
            .cloned()
            .collect()
    }

    fn advance(&self, rows: &[Row]) {
        let Some(last) = rows.last() else {
            return;
        };
        let synced = self.keys.synced_value(last);
        let mut progress = self.progress.lock();
        if let (Some(previous), Some(next)) = (progress.last_synced, synced) {
            if previous > next {
                error!(
                    channel = %self.channel,
                    previous,
                    next,
                    "last synced row moved backwards"
                );
            }
        }
        progress.last_row = Some(last.clone());
        progress.last_synced = synced;
    }

    // ---------------------------------------------------------------------
    // Primitives
    // ---------------------------------------------------------------------

    fn range_filter(&self, from: Option<f64>, to: Option<f64>) -> Filter {
        let field = self.keys.synced_field();
        let mut filter = self.filter.clone();
        if let Some(from) = from {
            filter = filter.and_also(Filter::gte(field, from));
        }
        if let Some(to) = to {
            filter = filter.and_also(Filter::lte(field, to));
        }
        filter
    }

    /// First row, last row and count of server rows in `[from, to]`.
    pub async fn server_row_info(&self, from: Option<f64>, to: Option<f64>) -> SyncResult<RowInfo> {
        let filter = self.range_filter(from, to);
        let params = FindParams::new()
            .with_select(self.keys.sync_fields())
            .with_limit(1);

        let first_row = self
            .table
            .find(&filter, &params.clone().with_order_by(self.keys.order_by(true)))
            .await?
            .into_iter()
            .next();
        let last_row = self
            .table
            .find(&filter, &params.with_order_by(self.keys.order_by(false)))
            .await?
            .into_iter()
            .next();
        let count = self.table.count(&filter).await?;

        Ok(RowInfo {
            first_row,
            last_row,
            count,
        })
    }

    /// Asks the client for row info over `range`.
    pub async fn client_row_info(&self, range: SyncRange) -> SyncResult<RowInfo> {
        match self.request(ServerMessage::sync_request(range)).await? {
            ClientMessage::SyncInfo { on_sync_request } => Ok(on_sync_request),
            ClientMessage::Error { error } => Err(SyncError::ClientRejected(error.to_string())),
            other => Err(SyncError::protocol(format!(
                "unexpected {} reply to onSyncRequest",
                other.kind()
            ))),
        }
    }

    /// Asks the client for a page of rows, returned in sync order.
    pub async fn client_page(&self, from_synced: f64, offset: u64) -> SyncResult<Vec<Row>> {
        let request = ServerMessage::pull_request(from_synced, offset, self.batch_size as u64);
        match self.request(request).await? {
            ClientMessage::Data { mut data } => {
                self.keys.sort(&mut data);
                Ok(data)
            }
            ClientMessage::Error { error } => Err(SyncError::ClientRejected(error.to_string())),
            other => Err(SyncError::protocol(format!(
                "unexpected {} reply to onPullRequest",
                other.kind()
            ))),
        }
    }

    /// Fetches a page of server rows with synced value at least `from_synced`.
    pub async fn server_page(&self, from_synced: f64, offset: u64) -> SyncResult<Vec<Row>> {
        let filter = self.range_filter(Some(from_synced), None);
        let params = FindParams::new()
            .with_select(self.select.clone())
            .with_order_by(self.keys.order_by(true))
            .with_limit(self.batch_size)
            .with_offset(offset as usize);
        self.table.find(&filter, &params).await
    }

    async fn server_page_or_notify(&self, from_synced: f64, offset: u64) -> SyncResult<Vec<Row>> {
        match self.server_page(from_synced, offset).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                error!(channel = %self.channel, error = %e, "sync server page query failed");
                if let Err(push_err) = self
                    .push(Vec::new(), false, Some(INTERNAL_ERROR_NOTICE.to_string()))
                    .await
                {
                    debug!(channel = %self.channel, error = %push_err, "could not notify client");
                }
                Err(e)
            }
        }
    }

    /// Applies client rows in one transaction.
    ///
    /// Unknown identities are inserted, known ones are updated when the
    /// incoming synced value is higher. The update filter repeats that
    /// guard so a concurrent newer write is never overwritten.
    pub async fn upsert(&self, rows: &[Row]) -> SyncResult<UpsertReport> {
        let mut report = UpsertReport {
            total: rows.len() as u64,
            ..UpsertReport::default()
        };

        let valid: Vec<&Row> = rows
            .iter()
            .filter(|row| match self.keys.validate(row) {
                Ok(()) => true,
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "rejecting invalid client row");
                    false
                }
            })
            .collect();
        report.rejected += (rows.len() - valid.len()) as u64;
        if valid.is_empty() {
            return Ok(report);
        }

        let mut tx = self.table.begin().await?;
        let existing = tx
            .find(
                &Filter::or(valid.iter().map(|row| self.keys.id_filter(row))),
                &FindParams::new()
                    .with_select(self.keys.sync_fields())
                    .with_order_by(self.keys.order_by(true)),
            )
            .await?;

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for row in valid {
            match existing.iter().find(|e| self.keys.ids_match(e, row)) {
                None => inserts.push(row.clone()),
                Some(current)
                    if self.keys.synced_value(current) < self.keys.synced_value(row) =>
                {
                    updates.push(row.clone())
                }
                Some(_) => {}
            }
        }

        if !updates.is_empty() {
            if self.rules.update {
                for row in &updates {
                    let synced = self.keys.require_synced(row)?;
                    let guard = self
                        .keys
                        .id_filter(row)
                        .and_also(Filter::lt(self.keys.synced_field(), synced));
                    report.updated += tx.update(&guard, self.keys.omit_ids(row)).await?;
                }
            } else {
                report.rejected += updates.len() as u64;
            }
        }

        if !inserts.is_empty() {
            if self.rules.insert {
                report.inserted += tx.insert(inserts).await?;
            } else {
                report.rejected += inserts.len() as u64;
            }
        }

        tx.commit().await?;
        debug!(
            channel = %self.channel,
            inserted = report.inserted,
            updated = report.updated,
            rejected = report.rejected,
            total = report.total,
            "client rows upserted"
        );
        Ok(report)
    }

    /// Deletes rows by identity, skipping rows that fail.
    pub async fn delete(&self, rows: &[Row]) -> SyncResult<u64> {
        if !self.can_delete() {
            warn!(channel = %self.channel, "client tried to delete rows without permission");
            return Ok(0);
        }

        let mut deleted = 0;
        for row in rows {
            if self.keys.id_fields().iter().any(|f| !row.contains_key(f)) {
                warn!(channel = %self.channel, "skipping delete of row without id fields");
                continue;
            }
            match self.table.delete(&self.keys.id_filter(row)).await {
                Ok(n) => deleted += n,
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "could not delete synced row");
                }
            }
        }
        Ok(deleted)
    }

    /// Pushes rows to the client and waits for `{ok: true}`.
    pub async fn push(
        &self,
        rows: Vec<Row>,
        is_fully_synced: bool,
        error: Option<String>,
    ) -> SyncResult<()> {
        match self
            .request(ServerMessage::push(rows, is_fully_synced, error))
            .await?
        {
            ClientMessage::Ack { ok: true } => Ok(()),
            ClientMessage::Error { error } => Err(SyncError::ClientRejected(error.to_string())),
            other => Err(SyncError::protocol(format!(
                "unexpected {} reply to push",
                other.kind()
            ))),
        }
    }

    async fn request(&self, message: ServerMessage) -> SyncResult<ClientMessage> {
        if self.is_closed() {
            return Err(SyncError::Cancelled);
        }
        if !self.client.is_connected() {
            return Err(SyncError::OrphanedDestination {
                connection: self.client.connection_id().to_string(),
            });
        }
        let reply = self.client.request(&self.channel, message);
        match self.client_timeout {
            Some(limit) => tokio::time::timeout(limit, reply)
                .await
                .map_err(|_| SyncError::Timeout)?,
            None => reply.await,
        }
    }

    // ---------------------------------------------------------------------
    // Write buffer
    // ---------------------------------------------------------------------

    /// Applies buffered client rows batch by batch until the buffer is empty.
    async fn flush(&self) {
        let mut last_applied: Vec<Row> = Vec::new();

        loop {
            if self.is_closed() {
                return;
            }
            // Waiting first lets a burst of edits coalesce.
            tokio::time::sleep(self.throttle).await;

            let batch = self.wal.lock().take_batch();
            if batch.is_empty() {
                break;
            }

            match self.upsert(&batch).await {
                Ok(report) => {
                    info!(
                        channel = %self.channel,
                        rows = batch.len(),
                        inserted = report.inserted,
                        updated = report.updated,
                        "client writes applied"
                    );
                    self.wal.lock().finish_batch(Instant::now());
                    last_applied = batch;
                }
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "could not apply client writes");
                    self.wal.lock().abandon_batch();
                }
            }
        }

        self.advance(&last_applied);
    }
}

fn log_pass_error(channel: &str, err: &SyncError) {
    match err {
        SyncError::Cancelled | SyncError::OrphanedDestination { .. } => {
            debug!(channel = %channel, error = %err, "sync pass abandoned");
        }
        _ => warn!(channel = %channel, error = %err, "sync pass failed"),
    }
}
