//! Test fixtures and hub helpers.
//!
//! Provides a hub wired to an in-memory database and helpers for the
//! common subscription and sync scenarios.

use livesync_engine::{
    ClientChannel, Destination, EngineConfig, ListenerConfig, LiveSync, MemoryClient,
    MemoryDatabase, MemoryTable, SubscribeParams, SyncError, SyncParams, SyncRules, TableRules,
};
use livesync_protocol::{pick_fields, ClientMessage, Filter, Row, SyncKeys, SyncRange};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Channel the test hub listens on.
pub const TEST_CHANNEL: &str = "livesync_test";

/// Batch size used by [`sync_rules`].
pub const TEST_BATCH_SIZE: usize = 4;

/// Converts a JSON object into a row.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Keys `id` / `synced`.
pub fn sync_keys() -> SyncKeys {
    SyncKeys::new(["id"], "synced").expect("valid sync keys")
}

/// Rows `{id: i, synced: i, kind: "even" | "odd"}`.
pub fn item_rows(range: std::ops::RangeInclusive<i64>) -> Vec<Row> {
    range
        .map(|i| {
            let kind = if i % 2 == 0 { "even" } else { "odd" };
            row(json!({ "id": i, "synced": i, "kind": kind }))
        })
        .collect()
}

/// Full access with sync rules on [`sync_keys`] and small batches.
pub fn sync_rules() -> TableRules {
    TableRules::all().with_sync(SyncRules::new(sync_keys()).with_batch_size(TEST_BATCH_SIZE))
}

/// A connected client with an empty replica.
pub fn empty_client(id: &str) -> Arc<MemoryClient> {
    replica_client(id, Vec::new())
}

/// A connected client whose replica holds `rows`.
pub fn replica_client(id: &str, rows: Vec<Row>) -> Arc<MemoryClient> {
    Arc::new(MemoryClient::new(id).with_replica(sync_keys(), rows))
}

/// Rows reduced to `(id, synced)` and sorted, for comparing replicas.
pub fn sync_state(rows: &[Row]) -> Vec<Row> {
    let keys = sync_keys();
    let mut state: Vec<Row> = rows
        .iter()
        .map(|r| pick_fields(r, &keys.sync_fields()))
        .collect();
    keys.sort(&mut state);
    state
}

/// Polls `check` every 10 ms for up to two seconds.
///
/// # Panics
///
/// Panics if `check` never returns true.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A hub over an in-memory database.
pub struct TestHub {
    /// The database.
    pub db: Arc<MemoryDatabase>,
    /// The hub.
    pub hub: Arc<LiveSync>,
}

impl TestHub {
    /// Creates a hub with the default engine configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Creates a hub with `config`. Listener failures are ignored.
    pub fn with_config(config: EngineConfig) -> Self {
        let db = Arc::new(MemoryDatabase::new());
        let hub = LiveSync::new(
            db.clone(),
            db.trigger_store(),
            config,
            ListenerConfig::new(3).with_retry_delay(Duration::from_millis(5)),
        )
        .with_fatal_hook(Arc::new(|_: &SyncError| {}));
        Self {
            db,
            hub: Arc::new(hub),
        }
    }

    /// Adds a table.
    pub fn with_table(self, name: &str, rows: Vec<Row>) -> Self {
        self.db.create_table(name, rows);
        self
    }

    /// Starts listening on [`TEST_CHANNEL`].
    ///
    /// # Panics
    ///
    /// Panics if the hub is already listening.
    pub fn started(self) -> Self {
        self.hub
            .start(self.db.notifications(), TEST_CHANNEL)
            .expect("start listening");
        self
    }

    /// Waits until the change feed connection is up.
    pub async fn wait_listening(&self) {
        eventually("listener", || self.hub.is_listening()).await;
    }

    /// A table by name.
    ///
    /// # Panics
    ///
    /// Panics if the table does not exist.
    pub fn table(&self, name: &str) -> Arc<MemoryTable> {
        self.db
            .memory_table(name)
            .unwrap_or_else(|| panic!("no table {name:?}"))
    }

    /// Subscribes `client` to `table` rows matching `filter` and returns the
    /// subscription channel.
    pub async fn subscribe(
        &self,
        client: &Arc<MemoryClient>,
        table: &str,
        filter: Filter,
    ) -> String {
        self.hub
            .registry()
            .add_subscription(
                Destination::Client(client.clone()),
                SubscribeParams::new(table).with_filter(filter),
                &TableRules::all(),
            )
            .await
            .expect("subscribe")
            .channel
    }

    /// Starts a sync of `table` with [`sync_rules`] and returns its channel.
    pub async fn sync(&self, client: &Arc<MemoryClient>, table: &str) -> String {
        self.sync_with(client, SyncParams::new(table), &sync_rules()).await
    }

    /// Starts a sync with explicit parameters and rules.
    pub async fn sync_with(
        &self,
        client: &Arc<MemoryClient>,
        params: SyncParams,
        rules: &TableRules,
    ) -> String {
        self.hub
            .registry()
            .add_sync(client.clone(), params, rules)
            .await
            .expect("start sync")
    }

    /// Runs a client-initiated pass, as when the client sends its row info.
    pub async fn client_pass(&self, client: &MemoryClient, channel: &str) {
        let session = self
            .hub
            .registry()
            .sync(client.connection_id(), channel)
            .unwrap_or_else(|| panic!("no sync on {channel:?}"));
        let info = client.row_info(&SyncRange::default());
        session
            .handle_client_message(ClientMessage::SyncInfo {
                on_sync_request: info,
            })
            .await
            .expect("client pass");
    }
}

impl Default for TestHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use crate::generators::ReplicaScenario;

    /// A hub with an `items` table of `count` rows.
    pub fn populated(count: i64) -> TestHub {
        TestHub::new().with_table("items", item_rows(1..=count))
    }

    /// A hub holding the scenario's server rows and a client holding its
    /// client rows.
    pub fn diverged(scenario: &ReplicaScenario) -> (TestHub, Arc<MemoryClient>) {
        let hub = TestHub::new().with_table("items", scenario.server_rows());
        let client = replica_client("c1", scenario.client_rows());
        (hub, client)
    }
}
