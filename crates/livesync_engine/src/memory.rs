//! In-memory backend.
//!
//! Tables, a trigger store and a notification source that behave like their
//! database counterparts closely enough to run the engine without a server.
//! Writes through a [`MemoryDatabase`] table fire change notifications for
//! every registered trigger condition the written rows match.

use crate::error::{SyncError, SyncResult};
use crate::listener::{NotificationSource, NotificationStream};
use crate::table::{Database, FindParams, TableHandle, TableTransaction};
use crate::trigger::{TriggerKey, TriggerSpec, TriggerStore};
use async_trait::async_trait;
use livesync_protocol::{compare_values, pick_fields, ChangeOp, Filter, Notification, Row};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Failures {
    finds_left: Option<usize>,
    writes: bool,
}

struct TableState {
    name: String,
    rows: Mutex<Vec<Row>>,
    failures: Mutex<Failures>,
    commits: AtomicUsize,
    notifier: Option<Notifier>,
}

impl TableState {
    fn check_find(&self) -> SyncResult<()> {
        let mut failures = self.failures.lock();
        match failures.finds_left {
            Some(0) => Err(SyncError::query(format!("find on {} failed", self.name))),
            Some(n) => {
                failures.finds_left = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn check_write(&self) -> SyncResult<()> {
        if self.failures.lock().writes {
            Err(SyncError::query(format!("write to {} failed", self.name)))
        } else {
            Ok(())
        }
    }

    fn notify(&self, op: ChangeOp, rows: &[Row]) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(&self.name, op, rows);
        }
    }
}

/// A table held in memory.
pub struct MemoryTable {
    state: Arc<TableState>,
}

impl MemoryTable {
    /// Creates an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rows(name, Vec::new())
    }

    /// Creates a table holding `rows`.
    pub fn with_rows(name: impl Into<String>, rows: Vec<Row>) -> Self {
        Self::build(name.into(), rows, None)
    }

    fn build(name: String, rows: Vec<Row>, notifier: Option<Notifier>) -> Self {
        Self {
            state: Arc::new(TableState {
                name,
                rows: Mutex::new(rows),
                failures: Mutex::new(Failures::default()),
                commits: AtomicUsize::new(0),
                notifier,
            }),
        }
    }

    /// Every row, in insertion order.
    pub fn rows(&self) -> Vec<Row> {
        self.state.rows.lock().clone()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.state.rows.lock().len()
    }

    /// True if the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of committed transactions.
    pub fn commits(&self) -> usize {
        self.state.commits.load(AtomicOrdering::SeqCst)
    }

    /// Lets the next `n` finds succeed and fails every find after them.
    pub fn fail_finds_after(&self, n: usize) {
        self.state.failures.lock().finds_left = Some(n);
    }

    /// Makes every write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.state.failures.lock().writes = fail;
    }

    /// Removes injected failures.
    pub fn clear_failures(&self) {
        *self.state.failures.lock() = Failures::default();
    }
}

fn select_rows(rows: &[Row], filter: &Filter, params: &FindParams) -> Vec<Row> {
    let mut found: Vec<Row> = rows.iter().filter(|r| filter.matches(r)).cloned().collect();
    if !params.order_by.is_empty() {
        found.sort_by(|a, b| {
            params
                .order_by
                .iter()
                .map(|order| {
                    let x = a.get(&order.field).unwrap_or(&Value::Null);
                    let y = b.get(&order.field).unwrap_or(&Value::Null);
                    let o = compare_values(x, y).unwrap_or(Ordering::Equal);
                    if order.ascending {
                        o
                    } else {
                        o.reverse()
                    }
                })
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        });
    }
    found
        .into_iter()
        .skip(params.offset)
        .take(params.limit.unwrap_or(usize::MAX))
        .map(|row| {
            if params.select.is_empty() {
                row
            } else {
                pick_fields(&row, &params.select)
            }
        })
        .collect()
}

/// Applies `changes` to matching rows and returns their old and new versions.
fn update_rows(rows: &mut [Row], filter: &Filter, changes: &Row) -> Vec<Row> {
    let mut touched = Vec::new();
    for row in rows.iter_mut().filter(|r| filter.matches(r)) {
        touched.push(row.clone());
        row.extend(changes.clone());
        touched.push(row.clone());
    }
    touched
}

#[async_trait]
impl TableHandle for MemoryTable {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn find(&self, filter: &Filter, params: &FindParams) -> SyncResult<Vec<Row>> {
        self.state.check_find()?;
        Ok(select_rows(&self.state.rows.lock(), filter, params))
    }

    async fn count(&self, filter: &Filter) -> SyncResult<u64> {
        Ok(self.state.rows.lock().iter().filter(|r| filter.matches(r)).count() as u64)
    }

    async fn insert(&self, rows: Vec<Row>) -> SyncResult<u64> {
        self.state.check_write()?;
        let n = rows.len() as u64;
        self.state.rows.lock().extend(rows.iter().cloned());
        self.state.notify(ChangeOp::Insert, &rows);
        Ok(n)
    }

    async fn update(&self, filter: &Filter, changes: Row) -> SyncResult<u64> {
        self.state.check_write()?;
        let touched = update_rows(&mut self.state.rows.lock(), filter, &changes);
        if !touched.is_empty() {
            self.state.notify(ChangeOp::Update, &touched);
        }
        Ok((touched.len() / 2) as u64)
    }

    async fn delete(&self, filter: &Filter) -> SyncResult<u64> {
        self.state.check_write()?;
        let removed: Vec<Row> = {
            let mut rows = self.state.rows.lock();
            let (removed, kept): (Vec<Row>, Vec<Row>) =
                rows.drain(..).partition(|r| filter.matches(r));
            *rows = kept;
            removed
        };
        if !removed.is_empty() {
            self.state.notify(ChangeOp::Delete, &removed);
        }
        Ok(removed.len() as u64)
    }

    async fn begin(&self) -> SyncResult<Box<dyn TableTransaction>> {
        let snapshot = self.state.rows.lock().clone();
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            rows: snapshot,
            inserted: Vec::new(),
            updated: Vec::new(),
        }))
    }
}

/// Snapshot transaction. Commit replaces the table contents.
struct MemoryTransaction {
    state: Arc<TableState>,
    rows: Vec<Row>,
    inserted: Vec<Row>,
    updated: Vec<Row>,
}

#[async_trait]
impl TableTransaction for MemoryTransaction {
    async fn find(&mut self, filter: &Filter, params: &FindParams) -> SyncResult<Vec<Row>> {
        self.state.check_find()?;
        Ok(select_rows(&self.rows, filter, params))
    }

    async fn insert(&mut self, rows: Vec<Row>) -> SyncResult<u64> {
        self.state.check_write()?;
        let n = rows.len() as u64;
        self.rows.extend(rows.iter().cloned());
        self.inserted.extend(rows);
        Ok(n)
    }

    async fn update(&mut self, filter: &Filter, changes: Row) -> SyncResult<u64> {
        self.state.check_write()?;
        let touched = update_rows(&mut self.rows, filter, &changes);
        let n = (touched.len() / 2) as u64;
        self.updated.extend(touched);
        Ok(n)
    }

    async fn commit(self: Box<Self>) -> SyncResult<()> {
        self.state.check_write()?;
        *self.state.rows.lock() = self.rows;
        self.state.commits.fetch_add(1, AtomicOrdering::SeqCst);
        if !self.inserted.is_empty() {
            self.state.notify(ChangeOp::Insert, &self.inserted);
        }
        if !self.updated.is_empty() {
            self.state.notify(ChangeOp::Update, &self.updated);
        }
        Ok(())
    }
}

/// A set of in-memory tables wired to a trigger store and notification
/// source, so writes fire change notifications.
pub struct MemoryDatabase {
    tables: RwLock<HashMap<String, Arc<MemoryTable>>>,
    triggers: Arc<MemoryTriggerStore>,
    notifications: Arc<MemoryNotificationSource>,
}

impl MemoryDatabase {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            triggers: Arc::new(MemoryTriggerStore::new()),
            notifications: Arc::new(MemoryNotificationSource::new()),
        }
    }

    /// Creates a table, replacing any table with the same name.
    pub fn create_table(&self, name: impl Into<String>, rows: Vec<Row>) -> Arc<MemoryTable> {
        let name = name.into();
        let notifier = Notifier {
            triggers: self.triggers.clone(),
            notifications: self.notifications.clone(),
        };
        let table = Arc::new(MemoryTable::build(name.clone(), rows, Some(notifier)));
        self.tables.write().insert(name, table.clone());
        table
    }

    /// Returns a table by name.
    pub fn memory_table(&self, name: &str) -> Option<Arc<MemoryTable>> {
        self.tables.read().get(name).cloned()
    }

    /// The trigger store backing this database.
    pub fn trigger_store(&self) -> Arc<MemoryTriggerStore> {
        self.triggers.clone()
    }

    /// The notification source fed by this database.
    pub fn notifications(&self) -> Arc<MemoryNotificationSource> {
        self.notifications.clone()
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for MemoryDatabase {
    fn table(&self, name: &str) -> Option<Arc<dyn TableHandle>> {
        self.tables
            .read()
            .get(name)
            .map(|t| t.clone() as Arc<dyn TableHandle>)
    }
}

#[derive(Clone)]
struct Notifier {
    triggers: Arc<MemoryTriggerStore>,
    notifications: Arc<MemoryNotificationSource>,
}

impl Notifier {
    fn notify(&self, table: &str, op: ChangeOp, rows: &[Row]) {
        let condition_ids: Vec<usize> = self
            .triggers
            .filters_on(table)
            .iter()
            .enumerate()
            .filter(|(_, filter)| rows.iter().any(|r| filter.matches(r)))
            .map(|(i, _)| i)
            .collect();
        if condition_ids.is_empty() {
            return;
        }
        let payload = Notification::Data {
            table: table.to_string(),
            op,
            condition_ids,
        }
        .format();
        self.notifications.send(payload);
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// Trigger store that records triggers instead of creating them.
#[derive(Default)]
pub struct MemoryTriggerStore {
    triggers: Mutex<BTreeMap<TriggerKey, Filter>>,
    creates: AtomicUsize,
    drops: AtomicUsize,
    fail_creates: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
}

impl MemoryTriggerStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of triggers created so far.
    pub fn created(&self) -> usize {
        self.creates.load(AtomicOrdering::SeqCst)
    }

    /// Number of triggers dropped so far.
    pub fn dropped(&self) -> usize {
        self.drops.load(AtomicOrdering::SeqCst)
    }

    /// Makes trigger creation fail.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, AtomicOrdering::SeqCst);
    }

    /// Delays every trigger creation, to widen races.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.lock() = delay;
    }

    /// True if the trigger exists.
    pub fn contains(&self, key: &TriggerKey) -> bool {
        self.triggers.lock().contains_key(key)
    }

    /// Conditions of the triggers on `table`, in byte order.
    pub fn conditions(&self, table: &str) -> Vec<String> {
        self.triggers
            .lock()
            .keys()
            .filter(|k| k.table == table)
            .map(|k| k.condition.clone())
            .collect()
    }

    fn filters_on(&self, table: &str) -> Vec<Filter> {
        self.triggers
            .lock()
            .iter()
            .filter(|(k, _)| k.table == table)
            .map(|(_, f)| f.clone())
            .collect()
    }
}

#[async_trait]
impl TriggerStore for MemoryTriggerStore {
    async fn create_trigger(&self, spec: &TriggerSpec) -> SyncResult<()> {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_creates.load(AtomicOrdering::SeqCst) {
            return Err(SyncError::query(format!(
                "permission denied to create trigger on {}",
                spec.table
            )));
        }
        self.triggers.lock().insert(spec.key(), spec.filter.clone());
        self.creates.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn drop_trigger(&self, key: &TriggerKey) -> SyncResult<()> {
        if self.triggers.lock().remove(key).is_some() {
            self.drops.fetch_add(1, AtomicOrdering::SeqCst);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Broadcasts payloads to every listening stream.
pub struct MemoryNotificationSource {
    sender: broadcast::Sender<String>,
    disconnect: watch::Sender<u64>,
    failing_connects: AtomicU32,
    connects: AtomicUsize,
    channels: Mutex<Vec<String>>,
}

impl MemoryNotificationSource {
    /// Creates a source with no listeners.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        let (disconnect, _) = watch::channel(0);
        Self {
            sender,
            disconnect,
            failing_connects: AtomicU32::new(0),
            connects: AtomicUsize::new(0),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Sends a payload. Returns how many streams received it.
    pub fn send(&self, payload: impl Into<String>) -> usize {
        let payload = payload.into();
        match self.sender.send(payload) {
            Ok(n) => n,
            Err(_) => {
                debug!("notification dropped, nobody is listening");
                0
            }
        }
    }

    /// Breaks every open stream, as a lost connection would.
    pub fn disconnect_all(&self) {
        self.disconnect.send_modify(|generation| *generation += 1);
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, AtomicOrdering::SeqCst);
    }

    /// Successful connections so far.
    pub fn connects(&self) -> usize {
        self.connects.load(AtomicOrdering::SeqCst)
    }

    /// Channels listened on, one entry per successful connection.
    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().clone()
    }
}

impl Default for MemoryNotificationSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSource for MemoryNotificationSource {
    async fn listen(&self, channel: &str) -> SyncResult<Box<dyn NotificationStream>> {
        let failing = self.failing_connects.load(AtomicOrdering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, AtomicOrdering::SeqCst);
            return Err(SyncError::ConnectionLost("connection refused".into()));
        }
        let disconnect = self.disconnect.subscribe();
        self.connects.fetch_add(1, AtomicOrdering::SeqCst);
        self.channels.lock().push(channel.to_string());
        Ok(Box::new(MemoryStream {
            receiver: self.sender.subscribe(),
            disconnect,
        }))
    }
}

struct MemoryStream {
    receiver: broadcast::Receiver<String>,
    disconnect: watch::Receiver<u64>,
}

#[async_trait]
impl NotificationStream for MemoryStream {
    async fn recv(&mut self) -> SyncResult<Option<String>> {
        loop {
            tokio::select! {
                next = self.receiver.recv() => match next {
                    Ok(payload) => return Ok(Some(payload)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(None),
                },
                changed = self.disconnect.changed() => {
                    return match changed {
                        Ok(()) => Err(SyncError::ConnectionLost("listen connection reset".into())),
                        Err(_) => Ok(None),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livesync_protocol::OrderBy;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn find_sorts_pages_and_selects() {
        let table = MemoryTable::with_rows(
            "items",
            (1..=5)
                .rev()
                .map(|i| row(json!({ "id": i, "synced": i * 10, "name": "x" })))
                .collect(),
        );
        let params = FindParams::new()
            .with_select(vec!["id".into()])
            .with_order_by(vec![OrderBy::asc("synced")])
            .with_offset(1)
            .with_limit(2);
        let found = table.find(&Filter::gt("id", 1), &params).await.unwrap();
        assert_eq!(found, vec![row(json!({ "id": 3 })), row(json!({ "id": 4 }))]);
        assert_eq!(table.count(&Filter::All).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn transaction_commits_or_rolls_back() {
        let table = MemoryTable::with_rows("items", vec![row(json!({ "id": 1, "v": 1 }))]);

        let mut tx = table.begin().await.unwrap();
        tx.update(&Filter::eq("id", 1), row(json!({ "v": 2 })))
            .await
            .unwrap();
        drop(tx);
        assert_eq!(table.rows(), vec![row(json!({ "id": 1, "v": 1 }))]);

        let mut tx = table.begin().await.unwrap();
        tx.insert(vec![row(json!({ "id": 2, "v": 1 }))]).await.unwrap();
        assert_eq!(tx.find(&Filter::All, &FindParams::new()).await.unwrap().len(), 2);
        tx.commit().await.unwrap();
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn injected_failures() {
        let table = MemoryTable::with_rows("items", vec![row(json!({ "id": 1 }))]);
        table.fail_finds_after(1);
        assert!(table.find(&Filter::All, &FindParams::new()).await.is_ok());
        assert!(table.find(&Filter::All, &FindParams::new()).await.is_err());

        table.fail_writes(true);
        assert!(table.insert(vec![row(json!({ "id": 2 }))]).await.is_err());

        table.clear_failures();
        assert!(table.find(&Filter::All, &FindParams::new()).await.is_ok());
        assert_eq!(table.insert(vec![row(json!({ "id": 2 }))]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn writes_notify_matching_conditions() {
        let db = MemoryDatabase::new();
        let table = db.create_table("items", Vec::new());
        let store = db.trigger_store();
        store
            .create_trigger(&TriggerSpec::new("items", Filter::eq("kind", "a")))
            .await
            .unwrap();
        store
            .create_trigger(&TriggerSpec::new("items", Filter::All))
            .await
            .unwrap();

        let mut stream = db.notifications().listen("ch").await.unwrap();

        table
            .insert(vec![row(json!({ "id": 1, "kind": "b" }))])
            .await
            .unwrap();
        let payload = stream.recv().await.unwrap().unwrap();
        assert_eq!(
            Notification::parse(&payload).unwrap(),
            Notification::Data {
                table: "items".into(),
                op: ChangeOp::Insert,
                condition_ids: vec![1],
            }
        );

        table
            .update(&Filter::eq("id", 1), row(json!({ "kind": "a" })))
            .await
            .unwrap();
        let payload = stream.recv().await.unwrap().unwrap();
        assert!(payload.ends_with("UPDATE|$ls$|0,1"));
    }

    #[tokio::test]
    async fn writes_without_triggers_stay_silent() {
        let db = MemoryDatabase::new();
        let table = db.create_table("items", Vec::new());
        let notifications = db.notifications();
        let mut stream = notifications.listen("ch").await.unwrap();
        table.insert(vec![row(json!({ "id": 1 }))]).await.unwrap();
        assert_eq!(notifications.send("probe"), 1);
        assert_eq!(stream.recv().await.unwrap().as_deref(), Some("probe"));
    }

    #[tokio::test]
    async fn streams_break_on_disconnect() {
        let source = MemoryNotificationSource::new();
        source.fail_next_connects(1);
        assert!(source.listen("ch").await.is_err());

        let mut stream = source.listen("ch").await.unwrap();
        source.disconnect_all();
        assert!(matches!(
            stream.recv().await,
            Err(SyncError::ConnectionLost(_))
        ));
        assert_eq!(source.connects(), 1);
        assert_eq!(source.channels(), vec!["ch".to_string()]);
    }

    #[tokio::test]
    async fn trigger_store_records_and_fails() {
        let store = MemoryTriggerStore::new();
        let spec = TriggerSpec::new("items", Filter::All);
        store.create_trigger(&spec).await.unwrap();
        assert!(store.contains(&spec.key()));
        assert_eq!(store.conditions("items"), vec!["TRUE".to_string()]);

        store.drop_trigger(&spec.key()).await.unwrap();
        store.drop_trigger(&spec.key()).await.unwrap();
        assert_eq!((store.created(), store.dropped()), (1, 1));

        store.fail_creates(true);
        assert!(store.create_trigger(&spec).await.is_err());
    }
}
