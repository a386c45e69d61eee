//! Subscription registry.
//!
//! Tracks live subscriptions and syncs by `(table, condition)` and fans
//! change events out to them. Subscriptions re-run their query and push the
//! result set, at most once per throttle window. Syncs run a reconciliation
//! pass.

use crate::client::ClientChannel;
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::replication::{PassSource, SessionParams, SyncSession};
use crate::table::{Database, FindParams, TableHandle, TableRules};
use crate::trigger::{TriggerCoordinator, TriggerKey, TriggerSpec};
use livesync_protocol::{
    subscription_channel, sync_channel, Filter, Row, ServerMessage, SubscribeRequest, SyncRequest,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Notice pushed to subscribers when a trigger condition fails to evaluate.
pub const SCHEMA_ERROR_NOTICE: &str = "INTERNAL ERROR. Schema might have changed. Check server logs";

/// What a local callback receives.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// The current result set.
    Data(Vec<Row>),
    /// The query failed.
    Error(String),
}

/// In-process subscriber.
pub type LocalCallback = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// Where subscription results go.
#[derive(Clone)]
pub enum Destination {
    /// A client connection channel.
    Client(Arc<dyn ClientChannel>),
    /// An in-process callback.
    Local(LocalCallback),
}

impl Destination {
    /// Connection id for client destinations.
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            Destination::Client(client) => Some(client.connection_id()),
            Destination::Local(_) => None,
        }
    }

    /// True for local callbacks.
    pub fn is_local(&self) -> bool {
        matches!(self, Destination::Local(_))
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Client(client) => f
                .debug_tuple("Client")
                .field(&client.connection_id())
                .finish(),
            Destination::Local(_) => f.write_str("Local"),
        }
    }
}

/// Parameters of a subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeParams {
    /// Table name.
    pub table: String,
    /// Row filter.
    pub filter: Filter,
    /// Columns to return. Empty returns all columns.
    pub select: Vec<String>,
    /// Requested push spacing.
    pub throttle: Option<Duration>,
}

impl SubscribeParams {
    /// Subscribes to every row of `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Sets the filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the selected columns.
    pub fn with_select(mut self, select: Vec<String>) -> Self {
        self.select = select;
        self
    }

    /// Sets the requested throttle.
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = Some(throttle);
        self
    }
}

impl From<SubscribeRequest> for SubscribeParams {
    fn from(request: SubscribeRequest) -> Self {
        Self {
            table: request.table,
            filter: request.filter,
            select: request.select,
            throttle: request.throttle.map(Duration::from_millis),
        }
    }
}

/// Parameters of a sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncParams {
    /// Table name.
    pub table: String,
    /// Row filter.
    pub filter: Filter,
    /// Columns pushed to the client. Empty pushes all columns.
    pub select: Vec<String>,
    /// Requested spacing between passes.
    pub throttle: Option<Duration>,
}

impl SyncParams {
    /// Syncs every row of `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Sets the filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the requested throttle.
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = Some(throttle);
        self
    }
}

impl From<SyncRequest> for SyncParams {
    fn from(request: SyncRequest) -> Self {
        Self {
            table: request.table,
            filter: request.filter,
            select: request.select,
            throttle: request.throttle.map(Duration::from_millis),
        }
    }
}

/// Returned by [`SubscriptionRegistry::add_subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    /// Subscription id.
    pub id: u64,
    /// Channel the results are pushed on.
    pub channel: String,
}

#[derive(Debug, Default)]
struct Pacing {
    last_pushed: Option<Instant>,
    trailing: bool,
}

enum Pace {
    Now,
    Later(Duration),
    Pending,
}

/// A live query.
pub struct Subscription {
    id: u64,
    channel: String,
    trigger: TriggerKey,
    table: Arc<dyn TableHandle>,
    filter: Filter,
    select: Vec<String>,
    throttle: Duration,
    destination: Destination,
    active: AtomicBool,
    pacing: Mutex<Pacing>,
}

impl Subscription {
    /// Subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Trigger the subscription depends on.
    pub fn trigger(&self) -> &TriggerKey {
        &self.trigger
    }

    /// Effective throttle.
    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    /// Destination.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// True until removed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn pace(&self, now: Instant) -> Pace {
        let mut pacing = self.pacing.lock();
        if pacing.trailing {
            return Pace::Pending;
        }
        match pacing.last_pushed {
            Some(at) if now < at + self.throttle => {
                pacing.trailing = true;
                Pace::Later(at + self.throttle - now)
            }
            _ => {
                pacing.last_pushed = Some(now);
                Pace::Now
            }
        }
    }

    /// Pushes now, or schedules one trailing push if inside the throttle window.
    async fn on_change(self: &Arc<Self>) -> SyncResult<()> {
        match self.pace(Instant::now()) {
            Pace::Now => self.push().await,
            Pace::Later(delay) => {
                debug!(
                    channel = %self.channel,
                    delay_ms = delay.as_millis() as u64,
                    "subscription throttled"
                );
                let sub = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    {
                        let mut pacing = sub.pacing.lock();
                        pacing.trailing = false;
                        pacing.last_pushed = Some(Instant::now());
                    }
                    if let Err(e) = sub.push().await {
                        debug!(
                            channel = %sub.channel,
                            error = %e,
                            "trailing subscription push failed"
                        );
                    }
                });
                Ok(())
            }
            Pace::Pending => Ok(()),
        }
    }

    /// Re-runs the query and delivers the result set, or the query error.
    async fn push(&self) -> SyncResult<()> {
        if !self.is_active() {
            return Ok(());
        }
        let params = FindParams::new().with_select(self.select.clone());
        match self.table.find(&self.filter, &params).await {
            Ok(rows) => {
                debug!(channel = %self.channel, rows = rows.len(), "pushing subscription data");
                self.deliver(SubscriptionEvent::Data(rows)).await
            }
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "subscription query failed");
                self.deliver(SubscriptionEvent::Error(e.to_string())).await
            }
        }
    }

    async fn deliver(&self, event: SubscriptionEvent) -> SyncResult<()> {
        match &self.destination {
            Destination::Client(client) => {
                let message = match event {
                    SubscriptionEvent::Data(data) => ServerMessage::Data { data },
                    SubscriptionEvent::Error(message) => ServerMessage::err(message),
                };
                client.emit(&self.channel, message).await
            }
            Destination::Local(callback) => {
                callback(event);
                Ok(())
            }
        }
    }
}

/// Registry of subscriptions and syncs.
pub struct SubscriptionRegistry {
    db: Arc<dyn Database>,
    triggers: Arc<TriggerCoordinator>,
    config: EngineConfig,
    subscriptions: RwLock<HashMap<u64, Arc<Subscription>>>,
    syncs: RwLock<Vec<Arc<SyncSession>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new(
        db: Arc<dyn Database>,
        triggers: Arc<TriggerCoordinator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            triggers,
            config,
            subscriptions: RwLock::new(HashMap::new()),
            syncs: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Trigger coordinator.
    pub fn triggers(&self) -> &Arc<TriggerCoordinator> {
        &self.triggers
    }

    fn table(&self, name: &str) -> SyncResult<Arc<dyn TableHandle>> {
        self.db
            .table(name)
            .ok_or_else(|| SyncError::UnknownTable(name.to_string()))
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    /// Registers a subscription and pushes the initial result set.
    ///
    /// A client subscribing twice to the same channel gets the existing
    /// subscription back.
    pub async fn add_subscription(
        &self,
        destination: Destination,
        params: SubscribeParams,
        rules: &TableRules,
    ) -> SyncResult<SubscriptionHandle> {
        if !rules.select {
            return Err(SyncError::rule_violation(format!(
                "subscribe is not allowed on {}",
                params.table
            )));
        }
        let table = self.table(&params.table)?;
        let throttle =
            rules.resolve_subscribe_throttle(self.config.subscription_throttle, params.throttle);
        let channel = subscription_channel(
            &self.config.channel_prefix,
            &params.table,
            &params.filter,
            &params.select,
        )?;

        if let Some(connection) = destination.connection_id() {
            if let Some(existing) = self.find_subscription(connection, &channel) {
                debug!(channel = %channel, connection = %connection, "subscription already exists");
                return Ok(SubscriptionHandle {
                    id: existing.id,
                    channel,
                });
            }
        }

        let trigger = self
            .triggers
            .ensure(&TriggerSpec::new(params.table.clone(), params.filter.clone()))
            .await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let sub = Arc::new(Subscription {
            id,
            channel: channel.clone(),
            trigger,
            table,
            filter: params.filter,
            select: params.select,
            throttle,
            destination,
            active: AtomicBool::new(true),
            pacing: Mutex::new(Pacing {
                last_pushed: Some(Instant::now()),
                trailing: false,
            }),
        });
        // Another subscribe for the same channel may have registered while
        // the trigger was being created.
        let duplicate = {
            let mut subs = self.subscriptions.write();
            let existing = sub
                .destination
                .connection_id()
                .and_then(|connection| find_in(&subs, connection, &channel))
                .map(|s| s.id);
            if existing.is_none() {
                subs.insert(id, sub.clone());
            }
            existing
        };
        if let Some(existing) = duplicate {
            sub.active.store(false, Ordering::SeqCst);
            self.triggers.release(&sub.trigger).await?;
            debug!(channel = %channel, "concurrent duplicate subscription dropped");
            return Ok(SubscriptionHandle {
                id: existing,
                channel,
            });
        }
        info!(
            table = %sub.trigger.table,
            condition = %sub.trigger.condition,
            channel = %channel,
            throttle_ms = throttle.as_millis() as u64,
            "subscription added"
        );

        if let Err(e) = sub.push().await {
            if matches!(e, SyncError::OrphanedDestination { .. }) {
                self.remove_subscription(id).await?;
            }
            return Err(e);
        }

        Ok(SubscriptionHandle { id, channel })
    }

    fn find_subscription(&self, connection: &str, channel: &str) -> Option<Arc<Subscription>> {
        find_in(&self.subscriptions.read(), connection, channel)
    }

    /// Removes a subscription and releases its trigger.
    /// Returns false if it did not exist.
    pub async fn remove_subscription(&self, id: u64) -> SyncResult<bool> {
        let removed = self.subscriptions.write().remove(&id);
        match removed {
            Some(sub) => {
                sub.active.store(false, Ordering::SeqCst);
                self.triggers.release(&sub.trigger).await?;
                debug!(channel = %sub.channel, id, "subscription removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes a local callback subscription.
    pub async fn remove_local(&self, id: u64) -> SyncResult<()> {
        let is_local = self
            .subscriptions
            .read()
            .get(&id)
            .map(|s| s.destination.is_local());
        match is_local {
            Some(true) => self.remove_subscription(id).await.map(|_| ()),
            _ => Err(SyncError::NotFound(format!("local subscription {id}"))),
        }
    }

    /// Removes a connection's subscription on `channel`.
    pub async fn unsubscribe(&self, connection: &str, channel: &str) -> SyncResult<bool> {
        match self.find_subscription(connection, channel) {
            Some(sub) => self.remove_subscription(sub.id).await,
            None => Ok(false),
        }
    }

    /// Subscription by id.
    pub fn subscription(&self, id: u64) -> Option<Arc<Subscription>> {
        self.subscriptions.read().get(&id).cloned()
    }

    /// Number of subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    // ---------------------------------------------------------------------
    // Syncs
    // ---------------------------------------------------------------------

    /// Registers a sync and returns its channel. The client starts the first
    /// pass with an `onSyncRequest`.
    ///
    /// Only one sync per connection and channel exists. A duplicate request
    /// is logged and answered with the existing channel.
    pub async fn add_sync(
        &self,
        client: Arc<dyn ClientChannel>,
        params: SyncParams,
        rules: &TableRules,
    ) -> SyncResult<String> {
        if rules.sync.is_none() {
            return Err(SyncError::rule_violation(format!(
                "sync is not allowed on {}",
                params.table
            )));
        }
        let table = self.table(&params.table)?;
        let channel = sync_channel(&self.config.channel_prefix, &params.table, &params.filter)?;

        if self.sync(client.connection_id(), &channel).is_some() {
            error!(
                channel = %channel,
                connection = %client.connection_id(),
                "duplicate sync request"
            );
            return Ok(channel);
        }

        let trigger = self
            .triggers
            .ensure(&TriggerSpec::new(params.table.clone(), params.filter.clone()))
            .await?;

        let session = SyncSession::new(
            SessionParams {
                channel: channel.clone(),
                trigger: trigger.clone(),
                table,
                client,
                filter: params.filter,
                select: params.select,
                rules: rules.clone(),
                throttle: params.throttle,
            },
            &self.config,
        );
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                self.triggers.release(&trigger).await?;
                return Err(e);
            }
        };

        info!(
            table = %trigger.table,
            condition = %trigger.condition,
            channel = %channel,
            connection = %session.connection_id(),
            "sync added"
        );
        self.syncs.write().push(session);
        Ok(channel)
    }

    /// Sync of a connection on `channel`.
    pub fn sync(&self, connection: &str, channel: &str) -> Option<Arc<SyncSession>> {
        self.syncs
            .read()
            .iter()
            .find(|s| s.channel() == channel && s.connection_id() == connection)
            .cloned()
    }

    /// Number of syncs.
    pub fn sync_count(&self) -> usize {
        self.syncs.read().len()
    }

    /// Closes a connection's sync on `channel` and releases its trigger.
    pub async fn remove_sync(&self, connection: &str, channel: &str) -> SyncResult<bool> {
        let removed = {
            let mut syncs = self.syncs.write();
            syncs
                .iter()
                .position(|s| s.channel() == channel && s.connection_id() == connection)
                .map(|i| syncs.remove(i))
        };
        match removed {
            Some(session) => {
                session.close();
                self.triggers.release(session.trigger()).await?;
                debug!(channel = %channel, connection = %connection, "sync removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes every subscription and sync of a connection.
    /// Returns how many were removed.
    pub async fn remove_connection(&self, connection: &str) -> usize {
        let subs: Vec<Arc<Subscription>> = {
            let mut subscriptions = self.subscriptions.write();
            let ids: Vec<u64> = subscriptions
                .values()
                .filter(|s| s.destination.connection_id() == Some(connection))
                .map(|s| s.id)
                .collect();
            ids.iter().filter_map(|id| subscriptions.remove(id)).collect()
        };
        let syncs: Vec<Arc<SyncSession>> = {
            let mut all = self.syncs.write();
            let (gone, kept): (Vec<_>, Vec<_>) =
                all.drain(..).partition(|s| s.connection_id() == connection);
            *all = kept;
            gone
        };

        let removed = subs.len() + syncs.len();
        let mut keys = Vec::with_capacity(removed);
        for sub in subs {
            sub.active.store(false, Ordering::SeqCst);
            keys.push(sub.trigger.clone());
        }
        for session in syncs {
            session.close();
            keys.push(session.trigger().clone());
        }
        for key in keys {
            if let Err(e) = self.triggers.release(&key).await {
                warn!(
                    table = %key.table,
                    condition = %key.condition,
                    error = %e,
                    "could not release trigger"
                );
            }
        }

        if removed > 0 {
            info!(connection = %connection, removed, "connection cleaned up");
        }
        removed
    }

    // ---------------------------------------------------------------------
    // Change events
    // ---------------------------------------------------------------------

    /// Fans a change of `(table, condition)` out to its subscriptions and syncs.
    pub async fn on_change_event(&self, table: &str, condition: &str) {
        let key = TriggerKey::new(table, condition);
        let subs: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.trigger == key)
            .cloned()
            .collect();
        let syncs: Vec<Arc<SyncSession>> = self
            .syncs
            .read()
            .iter()
            .filter(|s| *s.trigger() == key)
            .cloned()
            .collect();

        if subs.is_empty() && syncs.is_empty() {
            debug!(table = %table, condition = %condition, "change event without listeners");
            return;
        }

        for session in syncs {
            session.request_pass(PassSource::Trigger);
        }
        for sub in subs {
            if let Err(e) = sub.on_change().await {
                debug!(channel = %sub.channel, error = %e, "subscription push failed");
            }
        }
    }

    /// Tells every subscriber of `table` that a trigger condition failed.
    pub async fn on_trigger_error(&self, table: &str, message: &str) {
        error!(table = %table, error = %message, "trigger condition failed");
        let subs: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.trigger.table == table)
            .cloned()
            .collect();
        for sub in subs {
            if let Err(e) = sub
                .deliver(SubscriptionEvent::Error(SCHEMA_ERROR_NOTICE.to_string()))
                .await
            {
                debug!(channel = %sub.channel, error = %e, "could not deliver error notice");
            }
        }
    }
}

fn find_in(
    subs: &HashMap<u64, Arc<Subscription>>,
    connection: &str,
    channel: &str,
) -> Option<Arc<Subscription>> {
    subs.values()
        .find(|s| s.channel == channel && s.destination.connection_id() == Some(connection))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryClient;
    use crate::memory::MemoryDatabase;
    use crate::table::SyncRules;
    use livesync_protocol::SyncKeys;
    use serde_json::{json, Value};

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn setup() -> (Arc<MemoryDatabase>, SubscriptionRegistry) {
        let db = Arc::new(MemoryDatabase::new());
        db.create_table(
            "items",
            vec![
                row(json!({ "id": 1, "kind": "a", "synced": 1 })),
                row(json!({ "id": 2, "kind": "b", "synced": 2 })),
            ],
        );
        let triggers = Arc::new(TriggerCoordinator::new(db.trigger_store()));
        let registry = SubscriptionRegistry::new(db.clone(), triggers, EngineConfig::default());
        (db, registry)
    }

    #[tokio::test]
    async fn subscribe_pushes_initial_data() {
        let (_db, registry) = setup();
        let client = Arc::new(MemoryClient::new("c1"));
        let handle = registry
            .add_subscription(
                Destination::Client(client.clone()),
                SubscribeParams::new("items").with_filter(Filter::eq("kind", "a")),
                &TableRules::read_only(),
            )
            .await
            .unwrap();

        assert!(handle.channel.ends_with(".m.sub"));
        let pushes = client.subscription_data(&handle.channel);
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].len(), 1);
        assert_eq!(pushes[0][0]["id"], json!(1));
    }

    #[tokio::test]
    async fn duplicate_subscription_reuses_existing() {
        let (_db, registry) = setup();
        let client = Arc::new(MemoryClient::new("c1"));
        let params = SubscribeParams::new("items");
        let a = registry
            .add_subscription(
                Destination::Client(client.clone()),
                params.clone(),
                &TableRules::read_only(),
            )
            .await
            .unwrap();
        let b = registry
            .add_subscription(Destination::Client(client), params, &TableRules::read_only())
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(registry.triggers().refcount(&TriggerKey::new("items", "TRUE")), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicate_subscribes_register_once() {
        let (db, registry) = setup();
        db.trigger_store().set_create_delay(Some(Duration::from_millis(20)));
        let client = Arc::new(MemoryClient::new("c1"));
        let rules = TableRules::read_only();
        let subscribe = || {
            registry.add_subscription(
                Destination::Client(client.clone()),
                SubscribeParams::new("items"),
                &rules,
            )
        };

        let (a, b) = tokio::join!(subscribe(), subscribe());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a, b);
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(registry.triggers().refcount(&TriggerKey::new("items", "TRUE")), 1);
        assert_eq!(db.trigger_store().created(), 1);
        assert_eq!(client.subscription_data(&a.channel).len(), 1);
    }

    #[tokio::test]
    async fn rules_and_tables_are_checked() {
        let (_db, registry) = setup();
        let client = Arc::new(MemoryClient::new("c1"));
        let err = registry
            .add_subscription(
                Destination::Client(client.clone()),
                SubscribeParams::new("items"),
                &TableRules::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RuleViolation(_)));

        let err = registry
            .add_subscription(
                Destination::Client(client.clone()),
                SubscribeParams::new("nope"),
                &TableRules::read_only(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownTable(_)));

        let err = registry
            .add_sync(client, SyncParams::new("items"), &TableRules::all())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RuleViolation(_)));
        assert_eq!(registry.triggers().active_listeners().len(), 0);
    }

    #[tokio::test]
    async fn local_subscription_and_removal() {
        let (db, registry) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = registry
            .add_subscription(
                Destination::Local(Arc::new(move |event: SubscriptionEvent| {
                    sink.lock().push(event)
                })),
                SubscribeParams::new("items").with_select(vec!["id".into()]),
                &TableRules::read_only(),
            )
            .await
            .unwrap();
        assert_eq!(
            seen.lock()[0],
            SubscriptionEvent::Data(vec![row(json!({ "id": 1 })), row(json!({ "id": 2 }))])
        );

        registry.remove_local(handle.id).await.unwrap();
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(db.trigger_store().dropped(), 1);
        assert!(registry.remove_local(handle.id).await.is_err());
    }

    #[tokio::test]
    async fn trigger_errors_reach_subscribers() {
        let (_db, registry) = setup();
        let client = Arc::new(MemoryClient::new("c1"));
        let handle = registry
            .add_subscription(
                Destination::Client(client.clone()),
                SubscribeParams::new("items"),
                &TableRules::read_only(),
            )
            .await
            .unwrap();

        registry.on_trigger_error("items", "column \"kind\" does not exist").await;
        let last = client.received().pop().unwrap();
        assert_eq!(last, (handle.channel, ServerMessage::err(SCHEMA_ERROR_NOTICE)));
    }

    #[tokio::test]
    async fn connection_removal_releases_everything() {
        let (db, registry) = setup();
        let client = Arc::new(MemoryClient::new("c1"));
        registry
            .add_subscription(
                Destination::Client(client.clone()),
                SubscribeParams::new("items"),
                &TableRules::read_only(),
            )
            .await
            .unwrap();
        let rules =
            TableRules::all().with_sync(SyncRules::new(SyncKeys::new(["id"], "synced").unwrap()));
        let channel = registry
            .add_sync(
                client.clone(),
                SyncParams::new("items").with_filter(Filter::eq("kind", "a")),
                &rules,
            )
            .await
            .unwrap();
        assert!(channel.ends_with(".sync"));

        // Duplicate syncs are refused quietly.
        let again = registry
            .add_sync(
                client.clone(),
                SyncParams::new("items").with_filter(Filter::eq("kind", "a")),
                &rules,
            )
            .await
            .unwrap();
        assert_eq!(again, channel);
        assert_eq!(registry.sync_count(), 1);
        let session = registry.sync("c1", &channel).unwrap();

        assert_eq!(registry.remove_connection("c1").await, 2);
        assert!(session.is_closed());
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(registry.sync_count(), 0);
        assert_eq!(db.trigger_store().dropped(), 2);
        assert!(registry.triggers().active_listeners().is_empty());
    }
}
