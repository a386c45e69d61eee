//! Trigger management through the `app_triggers` table.

use crate::error::{PgError, PgResult};
use crate::sql::SqlCatalog;
use async_trait::async_trait;
use livesync_engine::{SyncError, SyncResult, TriggerKey, TriggerSpec, TriggerStore};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, info};

/// A `(table, condition)` pair an app listens to.
#[derive(Debug, Clone, PartialEq)]
pub struct AppTrigger {
    /// Owning app.
    pub app_id: String,
    /// Watched table.
    pub table_name: String,
    /// SQL condition.
    pub condition: String,
    /// Seconds since the owner last confirmed it.
    pub idle_secs: f64,
}

/// Records this app's triggers in `app_triggers`.
///
/// The database creates the table triggers when the first app listens to a
/// table and drops them after the last one stops.
#[derive(Clone)]
pub struct PgTriggerStore {
    pool: PgPool,
    catalog: Arc<SqlCatalog>,
    app_id: String,
}

impl PgTriggerStore {
    /// Creates a store for `app_id`.
    pub fn new(pool: PgPool, catalog: Arc<SqlCatalog>, app_id: impl Into<String>) -> Self {
        Self {
            pool,
            catalog,
            app_id: app_id.into(),
        }
    }

    /// Owning app.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// This app's triggers.
    pub async fn list(&self) -> PgResult<Vec<AppTrigger>> {
        list_triggers(&self.pool, &self.catalog, Some(&self.app_id)).await
    }

    /// Every app's triggers.
    pub async fn list_all(&self) -> PgResult<Vec<AppTrigger>> {
        list_triggers(&self.pool, &self.catalog, None).await
    }

    /// Removes every trigger of this app.
    pub async fn clear(&self) -> PgResult<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&self.catalog.lock_triggers())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(&self.catalog.clear_triggers())
            .bind(&self.app_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn probe(&self, table: &str, condition: &str) -> PgResult<()> {
        sqlx::query(&SqlCatalog::probe_condition(table, condition))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert(&self, table: &str, condition: &str) -> PgResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&self.catalog.lock_triggers())
            .execute(&mut *tx)
            .await?;
        sqlx::query(&self.catalog.add_trigger())
            .bind(&self.app_id)
            .bind(table)
            .bind(condition)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, table: &str, condition: &str) -> PgResult<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&self.catalog.lock_triggers())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(&self.catalog.remove_trigger())
            .bind(&self.app_id)
            .bind(table)
            .bind(condition)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TriggerStore for PgTriggerStore {
    async fn create_trigger(&self, spec: &TriggerSpec) -> SyncResult<()> {
        let condition = spec.condition();
        let failed = |err: PgError| SyncError::TriggerCreation {
            table: spec.table.clone(),
            condition: condition.clone(),
            message: err.to_string(),
        };

        // A bad condition would make the shared trigger function fail for
        // every app watching the table.
        self.probe(&spec.table, &condition).await.map_err(failed)?;
        self.insert(&spec.table, &condition).await.map_err(failed)?;
        info!(table = %spec.table, condition = %condition, "trigger registered");
        Ok(())
    }

    async fn drop_trigger(&self, key: &TriggerKey) -> SyncResult<()> {
        let removed = self.delete(&key.table, &key.condition).await?;
        debug!(
            table = %key.table,
            condition = %key.condition,
            removed,
            "trigger unregistered"
        );
        Ok(())
    }
}

/// Lists triggers of one app, or of all apps when `app_id` is `None`.
pub async fn list_triggers(
    pool: &PgPool,
    catalog: &SqlCatalog,
    app_id: Option<&str>,
) -> PgResult<Vec<AppTrigger>> {
    let rows = sqlx::query(&catalog.list_triggers())
        .bind(app_id)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| -> PgResult<AppTrigger> {
            Ok(AppTrigger {
                app_id: row.try_get("app_id")?,
                table_name: row.try_get("table_name")?,
                condition: row.try_get("condition")?,
                idle_secs: row.try_get::<Option<f64>, _>("idle_secs")?.unwrap_or(0.0),
            })
        })
        .collect()
}
