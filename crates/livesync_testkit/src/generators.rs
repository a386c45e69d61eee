//! Property-based test generators using proptest.
//!
//! Provides strategies for rows, filters and diverged replicas that keep the
//! invariants sync relies on: unique identities and synced values that only
//! grow.

use crate::fixtures::row;
use livesync_protocol::{Filter, Row};
use proptest::prelude::*;
use serde_json::json;

/// Identity offset of rows only one side holds.
const AHEAD_ID_BASE: i64 = 1000;

/// Strategy for a row `{id, synced, kind}` with `id` in `ids`.
pub fn row_strategy(ids: std::ops::Range<i64>) -> impl Strategy<Value = Row> {
    (ids, 0i64..1000, prop::sample::select(vec!["even", "odd", "other"]))
        .prop_map(|(id, synced, kind)| row(json!({ "id": id, "synced": synced, "kind": kind })))
}

/// Strategy for a set of rows with distinct ids.
pub fn rows_strategy(max_rows: usize) -> impl Strategy<Value = Vec<Row>> {
    prop::collection::vec(row_strategy(0..200), 0..max_rows).prop_map(|rows| {
        let mut seen = std::collections::HashSet::new();
        rows.into_iter()
            .filter(|r| seen.insert(r["id"].to_string()))
            .collect()
    })
}

/// Strategy for filters over the columns of [`row_strategy`].
pub fn filter_strategy() -> impl Strategy<Value = Filter> {
    let leaf = prop_oneof![
        Just(Filter::All),
        prop::sample::select(vec!["even", "odd", "missing"]).prop_map(|k| Filter::eq("kind", k)),
        (0i64..200).prop_map(|n| Filter::gt("id", n)),
        (0i64..1000).prop_map(|n| Filter::lte("synced", n)),
    ];
    leaf.prop_recursive(2, 8, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..3).prop_map(Filter::and),
            prop::collection::vec(inner.clone(), 1..3).prop_map(Filter::or),
            inner.prop_map(Filter::not),
        ]
    })
}

/// Client and server replicas that share a history and then diverge on
/// one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaScenario {
    /// Rows both sides hold, with ids and synced values `1..=common`.
    pub common: usize,
    /// Rows written on the server since the client last synced.
    pub server_ahead: usize,
    /// Rows written on the client while offline.
    pub client_ahead: usize,
    /// Consecutive rows sharing one synced value. 1 gives every row its own.
    pub tie_group: usize,
}

impl ReplicaScenario {
    /// Synced value of the `n`th row (1-based) under the tie grouping.
    fn synced_at(&self, n: i64) -> i64 {
        let group = self.tie_group.max(1) as i64;
        (n + group - 1) / group
    }

    fn shared(&self) -> Vec<Row> {
        (1..=self.common as i64)
            .map(|i| row(json!({ "id": i, "synced": self.synced_at(i), "kind": "shared" })))
            .collect()
    }

    fn ahead(&self, count: usize, kind: &str) -> Vec<Row> {
        let base = self.synced_at(self.common as i64);
        (1..=count as i64)
            .map(|k| {
                let synced = base + self.synced_at(k);
                row(json!({ "id": AHEAD_ID_BASE + k, "synced": synced, "kind": kind }))
            })
            .collect()
    }

    /// Rows the server starts with.
    pub fn server_rows(&self) -> Vec<Row> {
        let mut rows = self.shared();
        rows.extend(self.ahead(self.server_ahead, "server"));
        rows
    }

    /// Rows the client starts with.
    pub fn client_rows(&self) -> Vec<Row> {
        let mut rows = self.shared();
        rows.extend(self.ahead(self.client_ahead, "client"));
        rows
    }

    /// Rows both sides hold once synced.
    pub fn merged_rows(&self) -> Vec<Row> {
        let mut rows = self.shared();
        rows.extend(self.ahead(self.server_ahead.max(self.client_ahead), "merged"));
        rows
    }
}

/// Strategy for replica scenarios, including runs of rows that share a
/// synced value.
pub fn replica_scenario_strategy() -> impl Strategy<Value = ReplicaScenario> {
    (0usize..20, 0usize..15, any::<bool>(), 1usize..4).prop_map(
        |(common, ahead, client_side, tie_group)| {
            let (server_ahead, client_ahead) = if client_side { (0, ahead) } else { (ahead, 0) };
            ReplicaScenario {
                common,
                server_ahead,
                client_ahead,
                tie_group,
            }
        },
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{empty_client, scenarios, sync_state, TestHub};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn merged_rows_cover_both_sides() {
        let scenario = ReplicaScenario {
            common: 3,
            server_ahead: 0,
            client_ahead: 2,
            tie_group: 1,
        };
        assert_eq!(scenario.server_rows().len(), 3);
        assert_eq!(scenario.client_rows().len(), 5);
        assert_eq!(
            sync_state(&scenario.merged_rows()),
            sync_state(&scenario.client_rows())
        );
    }

    #[test]
    fn tied_scenario_shares_synced_values() {
        let scenario = ReplicaScenario {
            common: 11,
            server_ahead: 0,
            client_ahead: 3,
            tie_group: 3,
        };
        let synced: Vec<i64> = scenario
            .client_rows()
            .iter()
            .filter_map(|r| r["synced"].as_i64())
            .collect();
        assert_eq!(synced, vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 5, 5, 5]);
    }

    #[test]
    fn tied_numeric_ids_converge() {
        // Ids 9 and 10 share the last shared synced value.
        let scenario = ReplicaScenario {
            common: 10,
            server_ahead: 0,
            client_ahead: 4,
            tie_group: 2,
        };
        let (hub, client) = scenarios::diverged(&scenario);
        let (server, replica) = runtime().block_on(async {
            let channel = hub.sync(&client, "items").await;
            hub.client_pass(&client, &channel).await;
            (hub.table("items").rows(), client.replica_rows())
        });

        let expected = sync_state(&scenario.merged_rows());
        assert_eq!(sync_state(&server), expected);
        assert_eq!(sync_state(&replica), expected);
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn rows_have_distinct_ids(rows in rows_strategy(40)) {
            let ids: std::collections::HashSet<String> =
                rows.iter().map(|r| r["id"].to_string()).collect();
            prop_assert_eq!(ids.len(), rows.len());
        }

        #[test]
        fn one_client_pass_converges(scenario in replica_scenario_strategy()) {
            let (hub, client) = scenarios::diverged(&scenario);
            let (server, replica) = runtime().block_on(async {
                let channel = hub.sync(&client, "items").await;
                hub.client_pass(&client, &channel).await;
                (hub.table("items").rows(), client.replica_rows())
            });

            let expected = sync_state(&scenario.merged_rows());
            prop_assert_eq!(sync_state(&server), expected.clone());
            prop_assert_eq!(sync_state(&replica), expected);
        }

        #[test]
        fn initial_push_matches_filter(rows in rows_strategy(30), filter in filter_strategy()) {
            let hub = TestHub::new().with_table("items", rows.clone());
            let client = empty_client("c1");
            let pushed = runtime().block_on(async {
                let channel = hub.subscribe(&client, "items", filter.clone()).await;
                client.subscription_data(&channel)
            });

            let expected: Vec<Row> = rows.into_iter().filter(|r| filter.matches(r)).collect();
            prop_assert_eq!(pushed.len(), 1);
            prop_assert_eq!(sync_state(&pushed[0]), sync_state(&expected));
        }
    }
}
