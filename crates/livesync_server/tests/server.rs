//! End-to-end tests through the connection handlers.

use livesync_engine::{ClientChannel, TableRules};
use livesync_protocol::{Filter, SubscribeRequest, SyncRange, SyncRequest};
use livesync_server::{ServerConfig, StaticRules, SyncServer};
use livesync_testkit::{eventually, item_rows, replica_client, row, sync_rules, TestHub};
use serde_json::json;
use std::sync::Arc;

fn server(hub: &TestHub) -> SyncServer {
    // The hub comes from the fixture, so only the app id matters here.
    let config = ServerConfig::default().with_app_id("e2e");
    let rules = StaticRules::new()
        .with_table("items", sync_rules())
        .with_table("logs", TableRules::read_only());
    SyncServer::new(hub.hub.clone(), Arc::new(rules), config)
}

#[tokio::test]
async fn client_writes_reach_other_subscribers() {
    let hub = TestHub::new().with_table("items", item_rows(1..=4));
    let server = server(&hub);
    server.start(hub.db.notifications()).unwrap();
    eventually("listener", || server.hub().is_listening()).await;

    let writer = replica_client("writer", item_rows(1..=4));
    let reader = replica_client("reader", Vec::new());
    let writer_conn = server.connect(writer.clone()).unwrap();
    let reader_conn = server.connect(reader.clone()).unwrap();

    let sub = reader_conn
        .subscribe(SubscribeRequest {
            table: "items".into(),
            filter: Filter::eq("kind", "client"),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(reader.subscription_data(&sub).iter().all(|rows| rows.is_empty()));

    let channel = writer_conn
        .sync(SyncRequest {
            table: "items".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let info = serde_json::to_value(writer.row_info(&SyncRange::default())).unwrap();
    let reply = writer_conn
        .reply(&channel, json!({ "onSyncRequest": info }))
        .await;
    assert_eq!(reply, json!({ "ok": true }));

    let written = row(json!({ "id": 10, "synced": 10, "kind": "client" }));
    let reply = writer_conn
        .reply(&channel, json!({ "data": [written.clone()] }))
        .await;
    assert_eq!(reply, json!({ "ok": true }));
    let table = hub.table("items");
    eventually("client write applied", || table.len() == 5).await;

    eventually("push to subscriber", || {
        reader.subscription_data(&sub).last() == Some(&vec![written.clone()])
    })
    .await;

    server.stop().await;
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn rejected_requests_get_generic_errors() {
    let hub = TestHub::new().with_table("items", item_rows(1..=2));
    let server = server(&hub);
    let client = replica_client("c1", Vec::new());
    let conn = server.connect(client.clone()).unwrap();

    let reply = conn.reply("missing.sync", json!({ "data": [] })).await;
    assert!(reply["err"].is_string());

    // Read-only tables cannot be synced.
    let err = conn
        .sync(SyncRequest {
            table: "logs".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.is_client_error());

    assert_eq!(server.disconnect(client.connection_id()).await, 0);
}
