//! Request handlers for connection channels.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::rules::RuleResolver;
use livesync_engine::{ClientChannel, Destination, LiveSync, TableRules};
use livesync_protocol::{
    ClientMessage, SubscribeRequest, SyncRequest, UNSUBSCRIBE_SUFFIX, UNSYNC_SUFFIX,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// State shared by every connection of a server.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Engine hub.
    pub hub: Arc<LiveSync>,
    rules: Arc<dyn RuleResolver>,
}

impl HandlerContext {
    /// Creates a handler context.
    pub fn new(config: ServerConfig, hub: Arc<LiveSync>, rules: Arc<dyn RuleResolver>) -> Self {
        Self { config, hub, rules }
    }

    async fn rules_for(&self, connection: &str, table: &str) -> ServerResult<TableRules> {
        if table.is_empty() {
            return Err(ServerError::InvalidRequest("table is required".into()));
        }
        self.rules
            .table_rules(connection, table)
            .await?
            .ok_or_else(|| ServerError::NotAuthorized(format!("table {table:?} is not exposed")))
    }
}

/// Handles the requests of one client connection.
pub struct ConnectionHandler {
    context: Arc<HandlerContext>,
    client: Arc<dyn ClientChannel>,
}

impl ConnectionHandler {
    /// Creates a handler for `client`.
    pub fn new(context: Arc<HandlerContext>, client: Arc<dyn ClientChannel>) -> Self {
        Self { context, client }
    }

    /// Connection id.
    pub fn connection_id(&self) -> &str {
        self.client.connection_id()
    }

    /// Subscribes the connection and returns the subscription channel.
    ///
    /// The initial result set is pushed on that channel before this returns.
    pub async fn subscribe(&self, request: SubscribeRequest) -> ServerResult<String> {
        let rules = self
            .context
            .rules_for(self.connection_id(), &request.table)
            .await?;
        let handle = self
            .context
            .hub
            .registry()
            .add_subscription(Destination::Client(self.client.clone()), request.into(), &rules)
            .await?;
        debug!(
            connection = %self.connection_id(),
            channel = %handle.channel,
            "subscribed"
        );
        Ok(handle.channel)
    }

    /// Removes a subscription. Returns false if it did not exist.
    pub async fn unsubscribe(&self, channel: &str) -> ServerResult<bool> {
        Ok(self
            .context
            .hub
            .registry()
            .unsubscribe(self.connection_id(), channel)
            .await?)
    }

    /// Starts a sync and returns its channel.
    ///
    /// The client starts the first pass by sending its row info on the channel.
    pub async fn sync(&self, request: SyncRequest) -> ServerResult<String> {
        let rules = self
            .context
            .rules_for(self.connection_id(), &request.table)
            .await?;
        let channel = self
            .context
            .hub
            .registry()
            .add_sync(self.client.clone(), request.into(), &rules)
            .await?;
        info!(connection = %self.connection_id(), channel = %channel, "sync started");
        Ok(channel)
    }

    /// Stops a sync. Returns false if it did not exist.
    pub async fn unsync(&self, channel: &str) -> ServerResult<bool> {
        Ok(self
            .context
            .hub
            .registry()
            .remove_sync(self.connection_id(), channel)
            .await?)
    }

    /// Routes a message the client sent on `channel` and returns the reply.
    ///
    /// - `<subscription channel>unsubscribe` removes the subscription
    /// - `<sync channel>unsync` stops the sync
    /// - anything sent on a sync channel goes to its sync session
    pub async fn handle_message(&self, channel: &str, payload: Value) -> ServerResult<Value> {
        if let Some(base) = channel.strip_suffix(UNSUBSCRIBE_SUFFIX) {
            let removed = self.unsubscribe(base).await?;
            return Ok(json!({ "ok": removed }));
        }
        if let Some(base) = channel.strip_suffix(UNSYNC_SUFFIX) {
            let removed = self.unsync(base).await?;
            return Ok(json!({ "ok": removed }));
        }

        let session = self
            .context
            .hub
            .registry()
            .sync(self.connection_id(), channel)
            .ok_or_else(|| ServerError::UnknownChannel(channel.to_string()))?;
        let message = ClientMessage::from_value(payload)?;
        session.handle_client_message(message).await?;
        Ok(json!({ "ok": true }))
    }

    /// Like [`ConnectionHandler::handle_message`], but turns errors into an
    /// `{err}` reply.
    pub async fn reply(&self, channel: &str, payload: Value) -> Value {
        match self.handle_message(channel, payload).await {
            Ok(reply) => reply,
            Err(e) => self.error_reply(channel, &e),
        }
    }

    /// Builds the reply for a failed request and logs the failure.
    pub fn error_reply(&self, channel: &str, err: &ServerError) -> Value {
        if err.is_server_error() {
            error!(
                connection = %self.connection_id(),
                channel = %channel,
                error = %err,
                "request failed"
            );
        } else {
            warn!(
                connection = %self.connection_id(),
                channel = %channel,
                error = %err,
                "request rejected"
            );
        }
        json!({ "err": err.client_notice() })
    }

    /// Removes every subscription and sync of the connection.
    pub async fn disconnect(&self) -> usize {
        let removed = self
            .context
            .hub
            .registry()
            .remove_connection(self.connection_id())
            .await;
        info!(connection = %self.connection_id(), removed, "connection closed");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::StaticRules;
    use livesync_engine::{
        EngineConfig, ListenerConfig, MemoryClient, MemoryDatabase, SyncRules,
        INTERNAL_ERROR_NOTICE,
    };
    use livesync_protocol::{Filter, Row, ServerMessage, SyncKeys, SyncRange};

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn keys() -> SyncKeys {
        SyncKeys::new(["id"], "synced").unwrap()
    }

    fn setup() -> (Arc<MemoryDatabase>, Arc<MemoryClient>, ConnectionHandler) {
        let db = Arc::new(MemoryDatabase::new());
        db.create_table(
            "items",
            (1..=3)
                .map(|i| row(json!({ "id": i, "synced": i, "kind": "a" })))
                .collect(),
        );
        db.create_table("secrets", Vec::new());

        let hub = Arc::new(LiveSync::new(
            db.clone(),
            db.trigger_store(),
            EngineConfig::default(),
            ListenerConfig::default(),
        ));
        let rules = StaticRules::new()
            .with_table("items", TableRules::all().with_sync(SyncRules::new(keys())))
            .with_table("logs", TableRules::read_only());
        let context = Arc::new(HandlerContext::new(
            ServerConfig::default(),
            hub,
            Arc::new(rules),
        ));
        let client = Arc::new(MemoryClient::new("c1").with_replica(keys(), Vec::new()));
        let handler = ConnectionHandler::new(context, client.clone());
        (db, client, handler)
    }

    fn subscribe_request(table: &str) -> SubscribeRequest {
        SubscribeRequest {
            table: table.into(),
            filter: Filter::eq("kind", "a"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn subscribe_pushes_initial_data() {
        let (_db, client, handler) = setup();
        let channel = handler.subscribe(subscribe_request("items")).await.unwrap();

        let data = client.subscription_data(&channel);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].len(), 3);
    }

    #[tokio::test]
    async fn unexposed_tables_are_rejected() {
        let (_db, _client, handler) = setup();
        let err = handler.subscribe(subscribe_request("secrets")).await.unwrap_err();
        assert!(matches!(err, ServerError::NotAuthorized(_)));

        let err = handler.subscribe(subscribe_request("")).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn exposed_but_missing_table() {
        let (_db, _client, handler) = setup();
        let err = handler.subscribe(subscribe_request("logs")).await.unwrap_err();
        assert!(matches!(err, ServerError::Engine(_)));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn unsubscribe_channel_removes_subscription() {
        let (_db, _client, handler) = setup();
        let channel = handler.subscribe(subscribe_request("items")).await.unwrap();

        let reply = handler
            .handle_message(&format!("{channel}{UNSUBSCRIBE_SUFFIX}"), json!({}))
            .await
            .unwrap();
        assert_eq!(reply, json!({ "ok": true }));
        assert_eq!(handler.context.hub.registry().subscription_count(), 0);

        let reply = handler
            .handle_message(&format!("{channel}{UNSUBSCRIBE_SUFFIX}"), json!({}))
            .await
            .unwrap();
        assert_eq!(reply, json!({ "ok": false }));
    }

    #[tokio::test]
    async fn sync_messages_reach_the_session() {
        let (db, client, handler) = setup();
        let channel = handler
            .sync(SyncRequest {
                table: "items".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let info = serde_json::to_value(client.row_info(&SyncRange::default())).unwrap();
        let reply = handler
            .handle_message(&channel, json!({ "onSyncRequest": info }))
            .await
            .unwrap();
        assert_eq!(reply, json!({ "ok": true }));
        assert_eq!(client.replica_rows().len(), 3);

        let reply = handler
            .handle_message(
                &channel,
                json!({ "data": [{ "id": 9, "synced": 9, "kind": "b" }] }),
            )
            .await
            .unwrap();
        assert_eq!(reply, json!({ "ok": true }));
        let table = db.memory_table("items").unwrap();
        livesync_testkit::eventually("client write applied", || table.len() == 4).await;

        let reply = handler
            .handle_message(&format!("{channel}{UNSYNC_SUFFIX}"), json!({}))
            .await
            .unwrap();
        assert_eq!(reply, json!({ "ok": true }));
        assert_eq!(handler.context.hub.registry().sync_count(), 0);
    }

    #[tokio::test]
    async fn unknown_channels_and_bad_payloads() {
        let (_db, _client, handler) = setup();
        let reply = handler.reply("nope.sync", json!({ "data": [] })).await;
        assert!(reply["err"].as_str().unwrap().contains("unknown channel"));

        let channel = handler
            .sync(SyncRequest {
                table: "items".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let reply = handler.reply(&channel, json!([1, 2])).await;
        assert!(reply.get("err").is_some());

        let reply = handler.reply(&channel, json!({ "ok": true })).await;
        assert!(reply.get("err").is_some());
        assert_ne!(reply["err"], json!(INTERNAL_ERROR_NOTICE));
    }

    #[tokio::test]
    async fn disconnect_cleans_up() {
        let (_db, client, handler) = setup();
        handler.subscribe(subscribe_request("items")).await.unwrap();
        handler
            .sync(SyncRequest {
                table: "items".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        client.clear_received();
        assert_eq!(handler.disconnect().await, 2);
        assert_eq!(handler.context.hub.registry().subscription_count(), 0);
        assert_eq!(handler.context.hub.registry().sync_count(), 0);
        assert!(client
            .received()
            .iter()
            .all(|(_, msg)| !matches!(msg, ServerMessage::Push { .. })));
    }
}
