//! Client connection abstraction.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use livesync_protocol::{
    ClientMessage, PullRange, Row, RowInfo, ServerMessage, SyncKeys, SyncRange,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A client connection that can receive messages on named channels.
///
/// This trait abstracts the socket layer, allowing the engine to run against
/// a real connection or an in-memory client in tests.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    /// Connection id, unique per live connection.
    fn connection_id(&self) -> &str;

    /// Checks if the connection is still open.
    fn is_connected(&self) -> bool;

    /// Sends a message and waits for the client's reply.
    async fn request(&self, channel: &str, message: ServerMessage) -> SyncResult<ClientMessage>;

    /// Sends a message without waiting for a reply.
    async fn emit(&self, channel: &str, message: ServerMessage) -> SyncResult<()>;
}

/// Rows cached by a [`MemoryClient`].
#[derive(Debug, Clone)]
struct Replica {
    keys: SyncKeys,
    rows: Vec<Row>,
}

impl Replica {
    fn sorted_rows(&self) -> Vec<Row> {
        let mut rows = self.rows.clone();
        self.keys.sort(&mut rows);
        rows
    }

    fn row_info(&self, range: &SyncRange) -> RowInfo {
        let rows: Vec<Row> = self
            .sorted_rows()
            .into_iter()
            .filter(|row| {
                let synced = self.keys.synced_value(row).unwrap_or(f64::NEG_INFINITY);
                range.from_synced.map_or(true, |from| synced >= from)
                    && range.to_synced.map_or(true, |to| synced <= to)
            })
            .collect();
        let end_offset = range.end_offset.unwrap_or(0) as usize;
        let last_row = rows
            .len()
            .checked_sub(1 + end_offset)
            .and_then(|i| rows.get(i))
            .cloned();
        RowInfo {
            first_row: rows.first().cloned(),
            last_row,
            count: rows.len() as u64,
        }
    }

    fn page(&self, range: &PullRange) -> Vec<Row> {
        self.sorted_rows()
            .into_iter()
            .filter(|row| {
                self.keys
                    .synced_value(row)
                    .map_or(false, |synced| synced >= range.from_synced)
            })
            .skip(range.offset as usize)
            .take(range.limit as usize)
            .collect()
    }

    fn apply(&mut self, incoming: &[Row]) {
        for row in incoming {
            let incoming_synced = self.keys.synced_value(row);
            match self.rows.iter_mut().find(|r| self.keys.ids_match(r, row)) {
                Some(existing) => {
                    if incoming_synced >= self.keys.synced_value(existing) {
                        *existing = row.clone();
                    }
                }
                None => self.rows.push(row.clone()),
            }
        }
    }
}

/// An in-memory client for tests.
///
/// It answers sync requests from an optional replica, records every message
/// it receives and can be scripted to return canned replies.
#[derive(Debug)]
pub struct MemoryClient {
    id: String,
    connected: AtomicBool,
    replica: Mutex<Option<Replica>>,
    received: Mutex<Vec<(String, ServerMessage)>>,
    scripted: Mutex<VecDeque<ClientMessage>>,
    request_delay: Mutex<Option<Duration>>,
}

impl MemoryClient {
    /// Creates a connected client without a replica.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connected: AtomicBool::new(true),
            replica: Mutex::new(None),
            received: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            request_delay: Mutex::new(None),
        }
    }

    /// Gives the client a replica answering sync requests.
    pub fn with_replica(self, keys: SyncKeys, rows: Vec<Row>) -> Self {
        *self.replica.lock() = Some(Replica { keys, rows });
        self
    }

    /// Adds or replaces rows in the replica, as a local client edit would.
    pub fn edit_rows(&self, rows: Vec<Row>) {
        if let Some(replica) = self.replica.lock().as_mut() {
            for row in rows {
                match replica.rows.iter_mut().find(|r| replica.keys.ids_match(r, &row)) {
                    Some(existing) => *existing = row,
                    None => replica.rows.push(row),
                }
            }
        }
    }

    /// Removes rows from the replica by identity.
    pub fn remove_rows(&self, rows: &[Row]) {
        if let Some(replica) = self.replica.lock().as_mut() {
            let keys = replica.keys.clone();
            replica
                .rows
                .retain(|r| !rows.iter().any(|removed| keys.ids_match(r, removed)));
        }
    }

    /// Replica rows in sync order.
    pub fn replica_rows(&self) -> Vec<Row> {
        self.replica
            .lock()
            .as_ref()
            .map(Replica::sorted_rows)
            .unwrap_or_default()
    }

    /// Row info of the replica, as the client would report it.
    pub fn row_info(&self, range: &SyncRange) -> RowInfo {
        self.replica
            .lock()
            .as_ref()
            .map(|r| r.row_info(range))
            .unwrap_or_default()
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Queues a reply returned by the next request instead of the replica's answer.
    pub fn script_reply(&self, reply: ClientMessage) {
        self.scripted.lock().push_back(reply);
    }

    /// Delays every reply, to exercise timeouts.
    pub fn set_request_delay(&self, delay: Option<Duration>) {
        *self.request_delay.lock() = delay;
    }

    /// Every message received, with its channel.
    pub fn received(&self) -> Vec<(String, ServerMessage)> {
        self.received.lock().clone()
    }

    /// Clears recorded messages.
    pub fn clear_received(&self) {
        self.received.lock().clear();
    }

    /// Row batches pushed by sync passes, including empty end-of-pass markers.
    pub fn sync_pushes(&self) -> Vec<(Vec<Row>, bool)> {
        self.received
            .lock()
            .iter()
            .filter_map(|(_, msg)| match msg {
                ServerMessage::Push {
                    data,
                    is_fully_synced,
                    ..
                } => Some((data.clone(), *is_fully_synced)),
                _ => None,
            })
            .collect()
    }

    /// Subscription result sets delivered on `channel`.
    pub fn subscription_data(&self, channel: &str) -> Vec<Vec<Row>> {
        self.received
            .lock()
            .iter()
            .filter(|(ch, _)| ch == channel)
            .filter_map(|(_, msg)| match msg {
                ServerMessage::Data { data } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of page requests received.
    pub fn pull_requests(&self) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|(_, msg)| matches!(msg, ServerMessage::PullRequest { .. }))
            .count()
    }

    fn answer(&self, message: &ServerMessage) -> ClientMessage {
        if let Some(reply) = self.scripted.lock().pop_front() {
            return reply;
        }
        let mut replica = self.replica.lock();
        match message {
            ServerMessage::SyncRequest { on_sync_request } => ClientMessage::SyncInfo {
                on_sync_request: replica
                    .as_ref()
                    .map(|r| r.row_info(on_sync_request))
                    .unwrap_or_default(),
            },
            ServerMessage::PullRequest { on_pull_request } => ClientMessage::Data {
                data: replica
                    .as_ref()
                    .map(|r| r.page(on_pull_request))
                    .unwrap_or_default(),
            },
            ServerMessage::Push { data, .. } => {
                if let Some(replica) = replica.as_mut() {
                    replica.apply(data);
                }
                ClientMessage::ack()
            }
            ServerMessage::Data { .. } | ServerMessage::Err { .. } => ClientMessage::ack(),
        }
    }
}

#[async_trait]
impl ClientChannel for MemoryClient {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, channel: &str, message: ServerMessage) -> SyncResult<ClientMessage> {
        if !self.is_connected() {
            return Err(SyncError::OrphanedDestination {
                connection: self.id.clone(),
            });
        }
        let delay = *self.request_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self.answer(&message);
        self.received.lock().push((channel.to_string(), message));
        Ok(reply)
    }

    async fn emit(&self, channel: &str, message: ServerMessage) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::OrphanedDestination {
                connection: self.id.clone(),
            });
        }
        self.received.lock().push((channel.to_string(), message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn client() -> MemoryClient {
        let keys = SyncKeys::new(["id"], "synced").unwrap();
        MemoryClient::new("c1").with_replica(
            keys,
            (1..=10)
                .map(|i| row(json!({ "id": i, "synced": i })))
                .collect(),
        )
    }

    #[test]
    fn row_info_with_end_offset() {
        let client = client();
        let info = client.row_info(&SyncRange::default());
        assert_eq!(info.count, 10);
        assert_eq!(info.first_row.unwrap()["id"], json!(1));
        assert_eq!(info.last_row.unwrap()["id"], json!(10));

        let info = client.row_info(&SyncRange {
            from_synced: None,
            to_synced: Some(5.0),
            end_offset: Some(1),
        });
        assert_eq!(info.count, 5);
        assert_eq!(info.last_row.unwrap()["id"], json!(4));

        let info = client.row_info(&SyncRange {
            end_offset: Some(20),
            ..SyncRange::default()
        });
        assert!(info.last_row.is_none());
    }

    #[tokio::test]
    async fn answers_pull_requests() {
        let client = client();
        let reply = client
            .request("ch", ServerMessage::pull_request(3.0, 2, 3))
            .await
            .unwrap();
        match reply {
            ClientMessage::Data { data } => {
                let ids: Vec<Value> = data.iter().map(|r| r["id"].clone()).collect();
                assert_eq!(ids, vec![json!(5), json!(6), json!(7)]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.pull_requests(), 1);
    }

    #[tokio::test]
    async fn applies_pushes() {
        let client = client();
        let reply = client
            .request(
                "ch",
                ServerMessage::push(
                    vec![
                        row(json!({ "id": 1, "synced": 0 })),
                        row(json!({ "id": 2, "synced": 20 })),
                        row(json!({ "id": 11, "synced": 11 })),
                    ],
                    false,
                    None,
                ),
            )
            .await
            .unwrap();
        assert_eq!(reply, ClientMessage::ack());

        let rows = client.replica_rows();
        assert_eq!(rows.len(), 11);
        assert_eq!(rows[0]["synced"], json!(1));
        assert_eq!(rows.last().unwrap()["id"], json!(2));
        assert_eq!(client.sync_pushes().len(), 1);
    }

    #[tokio::test]
    async fn scripted_replies_and_disconnect() {
        let client = MemoryClient::new("c2");
        client.script_reply(ClientMessage::Error {
            error: json!("nope"),
        });
        let reply = client
            .request("ch", ServerMessage::push(vec![], true, None))
            .await
            .unwrap();
        assert!(matches!(reply, ClientMessage::Error { .. }));

        client.set_connected(false);
        let err = client
            .emit("ch", ServerMessage::err("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::OrphanedDestination { .. }));
    }
}
