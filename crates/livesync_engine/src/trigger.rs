//! Trigger coordination.
//!
//! Every subscription and sync depends on a database trigger for its
//! `(table, condition)` pair. The coordinator refcounts those pairs so a
//! trigger exists exactly while something references it.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use livesync_protocol::Filter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Identifies a trigger: a table and the SQL condition rows must match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerKey {
    /// Table name.
    pub table: String,
    /// Rendered filter condition.
    pub condition: String,
}

impl TriggerKey {
    /// Creates a trigger key.
    pub fn new(table: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            condition: condition.into(),
        }
    }
}

/// What a trigger store needs to create a trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSpec {
    /// Table name.
    pub table: String,
    /// Filter rows must match.
    pub filter: Filter,
}

impl TriggerSpec {
    /// Creates a trigger spec.
    pub fn new(table: impl Into<String>, filter: Filter) -> Self {
        Self {
            table: table.into(),
            filter,
        }
    }

    /// SQL condition of the filter.
    pub fn condition(&self) -> String {
        self.filter.to_sql()
    }

    /// Key of the trigger.
    pub fn key(&self) -> TriggerKey {
        TriggerKey::new(self.table.clone(), self.condition())
    }
}

/// Creates and drops database-side triggers.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Creates the trigger if it does not exist.
    async fn create_trigger(&self, spec: &TriggerSpec) -> SyncResult<()>;

    /// Drops the trigger if it exists.
    async fn drop_trigger(&self, key: &TriggerKey) -> SyncResult<()>;
}

struct Entry {
    spec: TriggerSpec,
    refcount: usize,
    created: Arc<OnceCell<()>>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.refcount > 0 && self.created.initialized()
    }
}

/// Refcounts triggers and keeps the store in step.
pub struct TriggerCoordinator {
    store: Arc<dyn TriggerStore>,
    entries: Mutex<HashMap<TriggerKey, Entry>>,
    // Last time each table's list of live conditions changed.
    changed: Mutex<HashMap<String, Instant>>,
    // Serializes store calls so a drop never overtakes a later create.
    ddl: tokio::sync::Mutex<()>,
}

impl TriggerCoordinator {
    /// Creates a coordinator over `store`.
    pub fn new(store: Arc<dyn TriggerStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
            changed: Mutex::new(HashMap::new()),
            ddl: tokio::sync::Mutex::new(()),
        }
    }

    /// Takes a reference on the trigger for `spec`, creating it if needed.
    ///
    /// Concurrent calls for the same key share one creation. If creation
    /// fails the reference is given back and the error is returned.
    pub async fn ensure(&self, spec: &TriggerSpec) -> SyncResult<TriggerKey> {
        let key = spec.key();
        let created = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                spec: spec.clone(),
                refcount: 0,
                created: Arc::new(OnceCell::new()),
            });
            entry.refcount += 1;
            entry.created.clone()
        };

        let result = created
            .get_or_try_init(|| async {
                let _ddl = self.ddl.lock().await;
                self.store.create_trigger(spec).await?;
                self.mark_changed(&key.table);
                info!(table = %key.table, condition = %key.condition, "trigger created");
                Ok::<(), SyncError>(())
            })
            .await;

        match result {
            Ok(_) => Ok(key),
            Err(e) => {
                self.forget(&key, &created);
                Err(SyncError::TriggerCreation {
                    table: key.table,
                    condition: key.condition,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Gives back a reference taken by [`TriggerCoordinator::ensure`].
    /// The trigger is dropped when the last reference goes.
    pub async fn release(&self, key: &TriggerKey) -> SyncResult<()> {
        let _ddl = self.ddl.lock().await;
        let should_drop = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                None => {
                    warn!(
                        table = %key.table,
                        condition = %key.condition,
                        "release of unknown trigger"
                    );
                    return Ok(());
                }
                Some(entry) => {
                    entry.refcount = entry.refcount.saturating_sub(1);
                    if entry.refcount == 0 {
                        let was_created = entry.created.initialized();
                        entries.remove(key);
                        if was_created {
                            self.mark_changed(&key.table);
                        }
                        was_created
                    } else {
                        false
                    }
                }
            }
        };

        if should_drop {
            self.store.drop_trigger(key).await?;
            info!(table = %key.table, condition = %key.condition, "trigger dropped");
        }
        Ok(())
    }

    /// Rolls back one reference after a failed creation.
    fn forget(&self, key: &TriggerKey, cell: &Arc<OnceCell<()>>) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            if Arc::ptr_eq(&entry.created, cell) {
                entry.refcount = entry.refcount.saturating_sub(1);
                if entry.refcount == 0 {
                    debug!(
                        table = %key.table,
                        condition = %key.condition,
                        "discarding failed trigger"
                    );
                    entries.remove(key);
                }
            }
        }
    }

    fn mark_changed(&self, table: &str) {
        self.changed.lock().insert(table.to_string(), Instant::now());
    }

    /// True if a condition on `table` went live or away less than `window` ago.
    pub fn changed_within(&self, table: &str, window: Duration) -> bool {
        self.changed
            .lock()
            .get(table)
            .is_some_and(|at| at.elapsed() < window)
    }

    /// Current refcount of a trigger.
    pub fn refcount(&self, key: &TriggerKey) -> usize {
        self.entries.lock().get(key).map_or(0, |e| e.refcount)
    }

    /// Conditions of created, referenced triggers on `table`, in byte order.
    ///
    /// Change notifications identify conditions by their position in this list.
    pub fn conditions(&self, table: &str) -> Vec<String> {
        let mut conditions: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(k, e)| k.table == table && e.is_live())
            .map(|(k, _)| k.condition.clone())
            .collect();
        conditions.sort();
        conditions
    }

    /// Every created, referenced trigger.
    pub fn active_listeners(&self) -> Vec<TriggerSpec> {
        let mut specs: Vec<TriggerSpec> = self
            .entries
            .lock()
            .values()
            .filter(|e| e.is_live())
            .map(|e| e.spec.clone())
            .collect();
        specs.sort_by(|a, b| a.key().cmp(&b.key()));
        specs
    }
}
