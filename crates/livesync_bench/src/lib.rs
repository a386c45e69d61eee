//! Benchmark utilities.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use livesync_protocol::Row;
use rand::Rng;
use serde_json::json;

/// Generates `count` rows with ids drawn from `0..id_space`, in write order.
///
/// Ids repeat when `id_space < count`, like a client editing the same rows
/// while offline. Synced values grow with each write.
pub fn random_writes(count: usize, id_space: u64) -> Vec<Row> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|n| {
            let id = rng.gen_range(0..id_space.max(1));
            let payload: u32 = rng.gen();
            object(json!({ "id": id, "synced": n, "payload": payload }))
        })
        .collect()
}

/// Generates rows `{id: i, synced: i}` for `i` in `1..=count`.
pub fn sequential_rows(count: usize) -> Vec<Row> {
    (1..=count)
        .map(|i| object(json!({ "id": i, "synced": i, "kind": "bench" })))
        .collect()
}

fn object(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Row::new(),
    }
}
