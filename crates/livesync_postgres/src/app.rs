//! App registration and heartbeat.

use crate::config::PgConfig;
use crate::error::{PgError, PgResult};
use crate::sql::SqlCatalog;
use livesync_engine::TriggerCoordinator;
use parking_lot::Mutex;
use sqlx::postgres::PgPool;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct HeartbeatState {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// This process's row in the apps table.
///
/// While the heartbeat runs, the app refreshes `last_check`, confirms the
/// triggers it still listens to and deletes the ones it stopped confirming.
pub struct PgApp {
    pool: PgPool,
    catalog: Arc<SqlCatalog>,
    app_id: String,
    heartbeat_interval: Duration,
    heartbeat_ms: i32,
    watch_schema: bool,
    heartbeat: Mutex<Option<HeartbeatState>>,
}

impl PgApp {
    /// Creates an unregistered app.
    pub fn new(
        pool: PgPool,
        catalog: Arc<SqlCatalog>,
        app_id: impl Into<String>,
        config: &PgConfig,
    ) -> Self {
        Self {
            pool,
            catalog,
            app_id: app_id.into(),
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_ms: config.heartbeat_ms(),
            watch_schema: config.watch_schema,
            heartbeat: Mutex::new(None),
        }
    }

    /// App id.
    pub fn id(&self) -> &str {
        &self.app_id
    }

    /// Notification channel of this app.
    pub fn channel(&self) -> String {
        self.catalog.channel(&self.app_id)
    }

    /// Drops apps that stopped heartbeating and syncs the schema watch.
    pub async fn prepare(&self) -> PgResult<()> {
        prune(&self.pool, &self.catalog).await
    }

    /// Inserts or refreshes the app row.
    pub async fn register(&self) -> PgResult<()> {
        sqlx::query(&self.catalog.register_app())
            .bind(&self.app_id)
            .bind(self.heartbeat_ms)
            .bind(self.watch_schema)
            .execute(&self.pool)
            .await?;
        info!(app_id = %self.app_id, watch_schema = self.watch_schema, "app registered");
        Ok(())
    }

    /// Runs one heartbeat for the given active triggers.
    pub async fn beat(&self, triggers: &TriggerCoordinator) -> PgResult<u64> {
        beat(
            &self.pool,
            &self.catalog,
            &self.app_id,
            self.heartbeat_interval,
            triggers,
        )
        .await
    }

    /// Spawns the heartbeat task. Does nothing if it is already running.
    ///
    /// The task holds the coordinator weakly and stops once it is dropped.
    pub fn start_heartbeat(&self, triggers: &Arc<TriggerCoordinator>) {
        let mut state = self.heartbeat.lock();
        if state.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(heartbeat_loop(
            self.pool.clone(),
            self.catalog.clone(),
            self.app_id.clone(),
            self.heartbeat_interval,
            Arc::downgrade(triggers),
            shutdown_rx,
        ));
        *state = Some(HeartbeatState {
            handle,
            shutdown_tx,
        });
    }

    /// True while the heartbeat task runs.
    pub fn is_beating(&self) -> bool {
        self.heartbeat
            .lock()
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Stops the heartbeat and waits for it to exit.
    pub async fn stop(&self) {
        let state = self.heartbeat.lock().take();
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(true);
            if let Err(e) = state.handle.await {
                warn!(error = %e, "heartbeat task failed");
            }
        }
    }

    /// Stops the heartbeat and deletes the app row.
    ///
    /// The app's triggers are deleted first so the table triggers of
    /// tables nobody else watches are dropped.
    pub async fn unregister(&self) -> PgResult<()> {
        self.stop().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&self.catalog.lock_triggers())
            .execute(&mut *tx)
            .await?;
        sqlx::query(&self.catalog.clear_triggers())
            .bind(&self.app_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&self.catalog.unregister_app())
            .bind(&self.app_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(app_id = %self.app_id, "app unregistered");
        Ok(())
    }
}

impl Drop for PgApp {
    fn drop(&mut self) {
        if let Some(state) = self.heartbeat.get_mut().take() {
            let _ = state.shutdown_tx.send(true);
            state.handle.abort();
        }
    }
}

/// Deletes apps that stopped heartbeating and their triggers, then creates
/// or drops the schema watch event trigger.
///
/// Fails with [`PgError::NotInstalled`] if the schema is missing.
pub async fn prune(pool: &PgPool, catalog: &SqlCatalog) -> PgResult<()> {
    let installed: bool = sqlx::query_scalar(&catalog.is_installed())
        .fetch_one(pool)
        .await?;
    if !installed {
        return Err(PgError::NotInstalled(catalog.schema().to_string()));
    }
    sqlx::raw_sql(&catalog.prepare()).execute(pool).await?;
    Ok(())
}

/// Period between heartbeats. Shorter than the interval stored in the apps
/// table so a slow beat does not look like a dead app.
pub(crate) fn beat_period(interval: Duration) -> Duration {
    interval.mul_f64(0.8)
}

/// Triggers unconfirmed for this long are deleted.
pub(crate) fn stale_after(interval: Duration) -> Duration {
    interval * 4
}

async fn beat(
    pool: &PgPool,
    catalog: &SqlCatalog,
    app_id: &str,
    interval: Duration,
    triggers: &TriggerCoordinator,
) -> PgResult<u64> {
    sqlx::query(&catalog.heartbeat())
        .bind(app_id)
        .execute(pool)
        .await?;

    let (tables, conditions): (Vec<String>, Vec<String>) = triggers
        .active_listeners()
        .iter()
        .map(|spec| (spec.table.clone(), spec.condition()))
        .unzip();
    if !tables.is_empty() {
        sqlx::query(&catalog.touch_triggers())
            .bind(app_id)
            .bind(&tables)
            .bind(&conditions)
            .execute(pool)
            .await?;
    }

    let stale_ms = i64::try_from(stale_after(interval).as_millis()).unwrap_or(i64::MAX);
    let mut tx = pool.begin().await?;
    sqlx::query(&catalog.lock_triggers())
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query(&catalog.delete_stale_triggers())
        .bind(app_id)
        .bind(stale_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;

    sqlx::query(&catalog.heartbeat_ended())
        .bind(app_id)
        .execute(pool)
        .await?;
    Ok(deleted)
}

async fn heartbeat_loop(
    pool: PgPool,
    catalog: Arc<SqlCatalog>,
    app_id: String,
    interval: Duration,
    triggers: Weak<TriggerCoordinator>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(beat_period(interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => {
                debug!(app_id = %app_id, "heartbeat stopped");
                return;
            }
        }

        let Some(triggers) = triggers.upgrade() else {
            debug!(app_id = %app_id, "trigger coordinator dropped, heartbeat stopped");
            return;
        };
        match beat(&pool, &catalog, &app_id, interval, &triggers).await {
            Ok(0) => {}
            Ok(deleted) => {
                warn!(app_id = %app_id, deleted, "deleted unconfirmed triggers");
            }
            Err(e) => {
                warn!(app_id = %app_id, error = %e, "heartbeat failed");
            }
        }
    }
}
