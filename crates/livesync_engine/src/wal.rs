//! Write-coalescing buffer for client writes.
//!
//! Rows a client sends in quick succession are buffered by identity. Later
//! edits of the same row merge into the pending one, so a burst of edits
//! costs one database write. Applied rows are remembered for a short while
//! so a reconciliation pass does not push them straight back to the client
//! that sent them.

use livesync_protocol::{Row, SyncKeys};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Pending, in-flight and recently applied client rows of one sync.
#[derive(Debug)]
pub struct WriteBuffer {
    keys: SyncKeys,
    batch_size: usize,
    history_age: Duration,
    changed: HashMap<String, Row>,
    sending: Vec<Row>,
    history: VecDeque<(Instant, Row)>,
}

impl WriteBuffer {
    /// Creates an empty buffer.
    pub fn new(keys: SyncKeys, batch_size: usize, history_age: Duration) -> Self {
        Self {
            keys,
            batch_size: batch_size.max(1),
            history_age,
            changed: HashMap::new(),
            sending: Vec::new(),
            history: VecDeque::new(),
        }
    }

    /// Buffers rows, merging them into pending rows with the same identity.
    /// Returns the number of distinct pending rows.
    pub fn add_rows(&mut self, rows: impl IntoIterator<Item = Row>) -> usize {
        for row in rows {
            let id = self.keys.id_key(&row);
            match self.changed.get_mut(&id) {
                Some(pending) => pending.extend(row),
                None => {
                    self.changed.insert(id, row);
                }
            }
        }
        self.changed.len()
    }

    /// Moves up to `batch_size` pending rows, in sync order, into the
    /// in-flight batch and returns them.
    pub fn take_batch(&mut self) -> Vec<Row> {
        let mut pending: Vec<Row> = self.changed.drain().map(|(_, row)| row).collect();
        self.keys.sort(&mut pending);

        let rest = if pending.len() > self.batch_size {
            pending.split_off(self.batch_size)
        } else {
            Vec::new()
        };
        for row in rest {
            self.changed.insert(self.keys.id_key(&row), row);
        }

        self.sending = pending.clone();
        pending
    }

    /// Marks the in-flight batch as applied and remembers it.
    pub fn finish_batch(&mut self, now: Instant) {
        self.prune_history(now);
        for row in self.sending.drain(..) {
            self.history.push_back((now, row));
        }
    }

    /// Drops the in-flight batch without remembering it.
    pub fn abandon_batch(&mut self) {
        self.sending.clear();
    }

    /// True if `row` was applied recently with the same version.
    pub fn is_in_history(&self, row: &Row, now: Instant) -> bool {
        self.history.iter().any(|(at, applied)| {
            now.duration_since(*at) <= self.history_age
                && self.keys.fully_match(Some(applied), Some(row))
        })
    }

    /// Forgets applied rows older than the history age.
    pub fn prune_history(&mut self, now: Instant) {
        while let Some((at, _)) = self.history.front() {
            if now.duration_since(*at) > self.history_age {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// True if no rows are pending.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    /// Number of pending rows.
    pub fn pending_len(&self) -> usize {
        self.changed.len()
    }

    /// True if a batch is in flight.
    pub fn is_sending(&self) -> bool {
        !self.sending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn buffer(batch_size: usize) -> WriteBuffer {
        WriteBuffer::new(
            SyncKeys::new(["id"], "synced").unwrap(),
            batch_size,
            Duration::from_secs(2),
        )
    }

    #[test]
    fn merges_edits_of_same_row() {
        let mut wal = buffer(10);
        wal.add_rows([row(json!({ "id": 1, "synced": 1, "name": "a", "done": false }))]);
        let pending = wal.add_rows([row(json!({ "id": 1, "synced": 2, "name": "b" }))]);
        assert_eq!(pending, 1);

        let batch = wal.take_batch();
        assert_eq!(
            batch,
            vec![row(json!({ "id": 1, "synced": 2, "name": "b", "done": false }))]
        );
        assert!(wal.is_sending());
        assert!(wal.is_empty());
    }

    #[test]
    fn batches_in_sync_order() {
        let mut wal = buffer(2);
        wal.add_rows((1..=5).rev().map(|i| row(json!({ "id": i, "synced": i }))));

        let first = wal.take_batch();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0]["id"], json!(1));
        assert_eq!(first[1]["id"], json!(2));
        assert_eq!(wal.pending_len(), 3);

        wal.finish_batch(Instant::now());
        let second = wal.take_batch();
        assert_eq!(second[0]["id"], json!(3));
    }

    #[test]
    fn history_expires() {
        let mut wal = buffer(10);
        let r = row(json!({ "id": 1, "synced": 5 }));
        wal.add_rows([r.clone()]);
        wal.take_batch();

        let start = Instant::now();
        wal.finish_batch(start);
        assert!(!wal.is_sending());
        assert!(wal.is_in_history(&r, start));
        assert!(!wal.is_in_history(&row(json!({ "id": 1, "synced": 6 })), start));

        let later = start + Duration::from_secs(3);
        assert!(!wal.is_in_history(&r, later));
        wal.prune_history(later);
        assert!(!wal.is_in_history(&r, start));
    }

    #[test]
    fn abandoned_batch_is_not_remembered() {
        let mut wal = buffer(10);
        let r = row(json!({ "id": 1, "synced": 5 }));
        wal.add_rows([r.clone()]);
        wal.take_batch();
        wal.abandon_batch();
        wal.finish_batch(Instant::now());
        assert!(!wal.is_in_history(&r, Instant::now()));
    }

    proptest! {
        #[test]
        fn every_identity_is_flushed_once(
            ids in proptest::collection::vec(0u32..30, 0..100),
            batch in 1usize..10,
        ) {
            let mut wal = buffer(batch);
            wal.add_rows(
                ids.iter()
                    .enumerate()
                    .map(|(n, id)| row(json!({ "id": id, "synced": n }))),
            );

            let mut seen = std::collections::HashSet::new();
            while !wal.is_empty() {
                let b = wal.take_batch();
                prop_assert!(b.len() <= batch);
                for r in &b {
                    prop_assert!(seen.insert(r["id"].to_string()));
                }
                wal.finish_batch(Instant::now());
            }
            let distinct: std::collections::HashSet<_> = ids.iter().collect();
            prop_assert_eq!(seen.len(), distinct.len());
        }
    }
}
