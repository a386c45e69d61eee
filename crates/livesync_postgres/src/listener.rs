//! `LISTEN` connections.

use crate::error::PgError;
use async_trait::async_trait;
use livesync_engine::{NotificationSource, NotificationStream, SyncError, SyncResult};
use sqlx::postgres::{PgListener, PgPool};
use tracing::debug;

/// Opens dedicated `LISTEN` connections from a pool's connect options.
///
/// Reconnecting is left to the engine's change feed listener: every
/// [`NotificationSource::listen`] call opens a fresh connection.
#[derive(Clone)]
pub struct PgNotificationSource {
    pool: PgPool,
}

impl PgNotificationSource {
    /// Creates a source that connects like `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn listen(&self, channel: &str) -> SyncResult<Box<dyn NotificationStream>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| SyncError::ConnectionLost(e.to_string()))?;
        listener
            .listen(channel)
            .await
            .map_err(|e| SyncError::from(PgError::from(e)))?;
        // PgListener reconnects silently on recv(); try_recv() surfaces the
        // drop so the engine can resync.
        debug!(channel = %channel, "LISTEN connection open");
        Ok(Box::new(PgStream { listener }))
    }
}

struct PgStream {
    listener: PgListener,
}

#[async_trait]
impl NotificationStream for PgStream {
    async fn recv(&mut self) -> SyncResult<Option<String>> {
        match self.listener.try_recv().await {
            Ok(Some(notification)) => Ok(Some(notification.payload().to_string())),
            Ok(None) => Ok(None),
            Err(e) => Err(SyncError::ConnectionLost(e.to_string())),
        }
    }
}
