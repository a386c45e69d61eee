//! Connection setup tying the pieces together.

use crate::app::PgApp;
use crate::config::PgConfig;
use crate::error::PgResult;
use crate::listener::PgNotificationSource;
use crate::sql::SqlCatalog;
use crate::triggers::{list_triggers, AppTrigger, PgTriggerStore};
use livesync_engine::TriggerCoordinator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use tracing::info;

/// A connected, registered app.
pub struct PgBackend {
    config: PgConfig,
    pool: PgPool,
    catalog: Arc<SqlCatalog>,
    app: Arc<PgApp>,
    source: Arc<PgNotificationSource>,
    triggers: Arc<PgTriggerStore>,
}

impl PgBackend {
    /// Opens a pool for `config`.
    pub async fn pool(config: &PgConfig) -> PgResult<PgPool> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;
        Ok(pool)
    }

    /// Connects, optionally installs the schema, prunes dead apps and
    /// registers `app_id`.
    pub async fn connect(config: PgConfig, app_id: impl Into<String>) -> PgResult<Self> {
        let pool = Self::pool(&config).await?;
        Self::with_pool(config, pool, app_id).await
    }

    /// Like [`PgBackend::connect`] on an existing pool.
    pub async fn with_pool(
        config: PgConfig,
        pool: PgPool,
        app_id: impl Into<String>,
    ) -> PgResult<Self> {
        config.validate()?;
        let app_id = app_id.into();
        let catalog = Arc::new(SqlCatalog::new(&config.schema, &config.notify_prefix)?);
        if config.install {
            install(&pool, &catalog).await?;
        }

        let app = Arc::new(PgApp::new(pool.clone(), catalog.clone(), &app_id, &config));
        app.prepare().await?;
        app.register().await?;

        Ok(Self {
            source: Arc::new(PgNotificationSource::new(pool.clone())),
            triggers: Arc::new(PgTriggerStore::new(pool.clone(), catalog.clone(), &app_id)),
            config,
            pool,
            catalog,
            app,
        })
    }

    /// Configuration.
    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    /// Connection pool.
    pub fn connection_pool(&self) -> &PgPool {
        &self.pool
    }

    /// SQL statements.
    pub fn catalog(&self) -> &Arc<SqlCatalog> {
        &self.catalog
    }

    /// The registered app.
    pub fn app(&self) -> &Arc<PgApp> {
        &self.app
    }

    /// Notification channel of the registered app.
    pub fn channel(&self) -> String {
        self.app.channel()
    }

    /// `LISTEN` connections for the change feed listener.
    pub fn source(&self) -> Arc<PgNotificationSource> {
        self.source.clone()
    }

    /// Trigger store for the trigger coordinator.
    pub fn trigger_store(&self) -> Arc<PgTriggerStore> {
        self.triggers.clone()
    }

    /// Starts the heartbeat for the triggers of `coordinator`.
    pub fn start_heartbeat(&self, coordinator: &Arc<TriggerCoordinator>) {
        self.app.start_heartbeat(coordinator);
    }

    /// Triggers of every app.
    pub async fn list_triggers(&self) -> PgResult<Vec<AppTrigger>> {
        list_triggers(&self.pool, &self.catalog, None).await
    }

    /// Unregisters the app and closes the pool.
    pub async fn shutdown(&self) -> PgResult<()> {
        self.app.unregister().await?;
        self.pool.close().await;
        Ok(())
    }
}

/// Runs the install SQL.
pub async fn install(pool: &PgPool, catalog: &SqlCatalog) -> PgResult<()> {
    sqlx::raw_sql(&catalog.install()).execute(pool).await?;
    info!(schema = %catalog.schema(), "bookkeeping schema installed");
    Ok(())
}

/// Removes the bookkeeping schema and every table trigger it created.
pub async fn uninstall(pool: &PgPool, catalog: &SqlCatalog) -> PgResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(&catalog.lock_triggers())
        .execute(&mut *tx)
        .await?;
    // Emptying app_triggers drops the table triggers.
    sqlx::query(&format!("DELETE FROM {}.app_triggers", catalog.schema()))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    sqlx::raw_sql(&catalog.uninstall()).execute(pool).await?;
    info!(schema = %catalog.schema(), "bookkeeping schema removed");
    Ok(())
}
