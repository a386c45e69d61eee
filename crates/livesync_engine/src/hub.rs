//! The `LiveSync` hub: wires the listener, trigger coordinator and registry.

use crate::config::{EngineConfig, ListenerConfig};
use crate::error::SyncResult;
use crate::listener::{ChangeFeedListener, FatalHook, NotificationHandler, NotificationSource};
use crate::subscription::{
    Destination, LocalCallback, SubscribeParams, SubscriptionHandle, SubscriptionRegistry,
};
use crate::table::{Database, TableRules};
use crate::trigger::{TriggerCoordinator, TriggerStore};
use livesync_protocol::Notification;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A DDL command reported by the schema watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    /// Command tag, such as `ALTER TABLE`.
    pub command: String,
    /// Event trigger event.
    pub event: String,
    /// Query text.
    pub query: String,
}

/// Called for every schema change notification.
pub type SchemaHook = Arc<dyn Fn(SchemaChange) + Send + Sync>;

/// Live subscriptions and syncs over one database.
pub struct LiveSync {
    config: EngineConfig,
    triggers: Arc<TriggerCoordinator>,
    registry: Arc<SubscriptionRegistry>,
    listener: ChangeFeedListener,
    schema_hook: Option<SchemaHook>,
}

impl LiveSync {
    /// Creates a hub. Nothing is listened to until [`LiveSync::start`].
    pub fn new(
        db: Arc<dyn Database>,
        store: Arc<dyn TriggerStore>,
        config: EngineConfig,
        listener_config: ListenerConfig,
    ) -> Self {
        let triggers = Arc::new(TriggerCoordinator::new(store));
        let registry = Arc::new(SubscriptionRegistry::new(db, triggers.clone(), config.clone()));
        Self {
            config,
            triggers,
            registry,
            listener: ChangeFeedListener::new(listener_config),
            schema_hook: None,
        }
    }

    /// Replaces the listener's fatal hook.
    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.listener = self.listener.with_fatal_hook(hook);
        self
    }

    /// Sets the schema change hook.
    pub fn with_schema_hook(mut self, hook: SchemaHook) -> Self {
        self.schema_hook = Some(hook);
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscription registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Trigger coordinator.
    pub fn triggers(&self) -> &Arc<TriggerCoordinator> {
        &self.triggers
    }

    /// True while the change feed connection is up.
    pub fn is_listening(&self) -> bool {
        self.listener.is_listening()
    }

    /// Starts listening on `channel`. Every payload is dispatched on its own task.
    pub fn start(
        self: &Arc<Self>,
        source: Arc<dyn NotificationSource>,
        channel: impl Into<String>,
    ) -> SyncResult<()> {
        let hub = Arc::downgrade(self);
        let handler: NotificationHandler = Arc::new(move |payload: String| {
            if let Some(hub) = hub.upgrade() {
                tokio::spawn(async move { hub.dispatch(&payload).await });
            }
        });
        let channel = channel.into();
        info!(channel = %channel, "starting change feed");
        self.listener.start(source, channel, handler)
    }

    /// Stops the change feed.
    pub async fn stop(&self) {
        self.listener.stop().await;
    }

    /// Routes one raw notification payload.
    pub async fn dispatch(&self, payload: &str) {
        let notification = match Notification::parse(payload) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "ignoring malformed notification");
                return;
            }
        };

        match notification {
            Notification::Data {
                table,
                op,
                condition_ids,
            } => {
                let conditions = self.triggers.conditions(&table);
                debug!(table = %table, op = %op, ids = ?condition_ids, "change notification");
                // Positions index the condition list the database saw when it
                // fired. A condition added or removed since then shifts them.
                if !condition_ids.is_empty()
                    && self.triggers.changed_within(&table, self.config.condition_settle)
                {
                    debug!(table = %table, "conditions changed recently, notifying all");
                    for condition in &conditions {
                        self.registry.on_change_event(&table, condition).await;
                    }
                    return;
                }
                for id in condition_ids {
                    match conditions.get(id) {
                        Some(condition) => self.registry.on_change_event(&table, condition).await,
                        None => warn!(
                            table = %table,
                            id,
                            known = conditions.len(),
                            "notification for unknown trigger condition"
                        ),
                    }
                }
            }
            Notification::ConditionError { table, message, .. } => {
                self.registry.on_trigger_error(&table, &message).await;
            }
            Notification::Schema {
                command,
                event,
                query,
            } => {
                info!(command = %command, event = %event, "schema changed");
                if let Some(hook) = &self.schema_hook {
                    hook(SchemaChange {
                        command,
                        event,
                        query,
                    });
                }
            }
        }
    }

    /// Subscribes an in-process callback.
    pub async fn subscribe_local(
        &self,
        params: SubscribeParams,
        rules: &TableRules,
        callback: LocalCallback,
    ) -> SyncResult<SubscriptionHandle> {
        self.registry
            .add_subscription(Destination::Local(callback), params, rules)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::memory::MemoryDatabase;
    use crate::subscription::SubscriptionEvent;
    use livesync_protocol::{ChangeOp, Filter, DELIMITER};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn hub(db: &Arc<MemoryDatabase>, settle: Duration) -> Arc<LiveSync> {
        Arc::new(
            LiveSync::new(
                db.clone(),
                db.trigger_store(),
                EngineConfig::default()
                    .with_subscription_throttle(Duration::ZERO)
                    .with_condition_settle(settle),
                ListenerConfig::default(),
            )
            .with_fatal_hook(Arc::new(|_: &SyncError| {})),
        )
    }

    async fn subscribe_kind(
        hub: &LiveSync,
        kind: &'static str,
        seen: &Arc<Mutex<Vec<&'static str>>>,
    ) {
        let sink = seen.clone();
        hub.subscribe_local(
            SubscribeParams::new("items").with_filter(Filter::eq("kind", kind)),
            &TableRules::read_only(),
            Arc::new(move |_event: SubscriptionEvent| sink.lock().push(kind)),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn dispatch_maps_condition_ids() {
        let db = Arc::new(MemoryDatabase::new());
        db.create_table("items", Vec::new());
        let hub = hub(&db, Duration::ZERO);

        let counts = Arc::new(Mutex::new(Vec::new()));
        for kind in ["a", "b"] {
            subscribe_kind(&hub, kind, &counts).await;
        }
        counts.lock().clear();

        // Condition 1 is `"kind" = 'b'`.
        let payload = Notification::Data {
            table: "items".into(),
            op: ChangeOp::Insert,
            condition_ids: vec![1, 7],
        }
        .format();
        hub.dispatch(&payload).await;
        assert_eq!(*counts.lock(), vec!["b"]);
    }

    #[tokio::test]
    async fn condition_changes_widen_notifications() {
        let db = Arc::new(MemoryDatabase::new());
        db.create_table("items", Vec::new());
        let hub = hub(&db, Duration::from_secs(60));

        let seen = Arc::new(Mutex::new(Vec::new()));
        subscribe_kind(&hub, "a", &seen).await;
        subscribe_kind(&hub, "c", &seen).await;
        // Sent while `"kind" = 'c'` was at position 1.
        let payload = Notification::Data {
            table: "items".into(),
            op: ChangeOp::Update,
            condition_ids: vec![1],
        }
        .format();

        // Now position 1 is `"kind" = 'b'`.
        subscribe_kind(&hub, "b", &seen).await;
        seen.lock().clear();
        hub.dispatch(&payload).await;

        let mut notified = seen.lock().clone();
        notified.sort();
        assert_eq!(notified, vec!["a", "b", "c"]);

        // Notifications that name no condition stay ignored.
        seen.lock().clear();
        let empty = Notification::Data {
            table: "items".into(),
            op: ChangeOp::Update,
            condition_ids: Vec::new(),
        }
        .format();
        hub.dispatch(&empty).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn schema_and_garbage_payloads() {
        let db = Arc::new(MemoryDatabase::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hub = Arc::new(
            LiveSync::new(
                db.clone(),
                db.trigger_store(),
                EngineConfig::default(),
                ListenerConfig::default(),
            )
            .with_schema_hook(Arc::new(move |change: SchemaChange| sink.lock().push(change))),
        );

        hub.dispatch("not a payload").await;
        hub.dispatch(&format!(
            "schema_has_changed{DELIMITER}ALTER TABLE{DELIMITER}ddl_command_end{DELIMITER}alter table items add x int"
        ))
        .await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].command, "ALTER TABLE");
        assert_eq!(seen[0].query, "alter table items add x int");
    }
}
