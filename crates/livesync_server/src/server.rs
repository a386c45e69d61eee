//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{ConnectionHandler, HandlerContext};
use crate::rules::RuleResolver;
use livesync_engine::{
    ClientChannel, Database, LiveSync, NotificationSource, SchemaChange, TriggerStore,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// The sync server.
///
/// Owns the engine hub and the handlers of all open connections. The
/// transport layer calls [`SyncServer::connect`] when a socket opens and
/// [`SyncServer::disconnect`] when it closes.
///
/// # Example
///
/// ```
/// use livesync_engine::MemoryDatabase;
/// use livesync_server::{ServerConfig, StaticRules, SyncServer};
/// use std::sync::Arc;
///
/// let db = Arc::new(MemoryDatabase::new());
/// let server = SyncServer::build(
///     db.clone(),
///     db.trigger_store(),
///     Arc::new(StaticRules::new()),
///     ServerConfig::default(),
/// );
/// assert_eq!(server.connection_count(), 0);
/// ```
pub struct SyncServer {
    context: Arc<HandlerContext>,
    connections: RwLock<HashMap<String, Arc<ConnectionHandler>>>,
}

impl SyncServer {
    /// Creates a server around an existing hub.
    pub fn new(hub: Arc<LiveSync>, rules: Arc<dyn RuleResolver>, config: ServerConfig) -> Self {
        Self {
            context: Arc::new(HandlerContext::new(config, hub, rules)),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a server and its hub from the configuration.
    pub fn build(
        db: Arc<dyn Database>,
        store: Arc<dyn TriggerStore>,
        rules: Arc<dyn RuleResolver>,
        config: ServerConfig,
    ) -> Self {
        let mut hub = LiveSync::new(db, store, config.engine.clone(), config.listener.clone());
        if config.watch_schema {
            hub = hub.with_schema_hook(Arc::new(|change: SchemaChange| {
                warn!(
                    command = %change.command,
                    event = %change.event,
                    query = %change.query,
                    "database schema changed"
                );
            }));
        }
        Self::new(Arc::new(hub), rules, config)
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Engine hub.
    pub fn hub(&self) -> &Arc<LiveSync> {
        &self.context.hub
    }

    /// Starts listening for change notifications on this process's channel.
    pub fn start(&self, source: Arc<dyn NotificationSource>) -> ServerResult<()> {
        let channel = self.config().notification_channel();
        info!(app_id = %self.config().app_id, channel = %channel, "starting sync server");
        self.context.hub.start(source, channel)?;
        Ok(())
    }

    /// Stops listening and closes every connection.
    pub async fn stop(&self) {
        let ids: Vec<String> = self.connections.read().keys().cloned().collect();
        for id in ids {
            self.disconnect(&id).await;
        }
        self.context.hub.stop().await;
    }

    /// Registers a connection and returns its handler.
    pub fn connect(&self, client: Arc<dyn ClientChannel>) -> ServerResult<Arc<ConnectionHandler>> {
        let id = client.connection_id().to_string();
        let mut connections = self.connections.write();
        if connections.contains_key(&id) {
            return Err(ServerError::DuplicateConnection(id));
        }
        let max = self.context.config.max_connections;
        if connections.len() >= max {
            return Err(ServerError::ConnectionLimit(max));
        }
        let handler = Arc::new(ConnectionHandler::new(self.context.clone(), client));
        connections.insert(id, handler.clone());
        Ok(handler)
    }

    /// Handler of an open connection.
    pub fn connection(&self, connection_id: &str) -> Option<Arc<ConnectionHandler>> {
        self.connections.read().get(connection_id).cloned()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Forgets a connection and removes its subscriptions and syncs.
    /// Returns how many were removed.
    pub async fn disconnect(&self, connection_id: &str) -> usize {
        let handler = self.connections.write().remove(connection_id);
        match handler {
            Some(handler) => handler.disconnect().await,
            None => 0,
        }
    }
}
