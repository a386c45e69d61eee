//! Server configuration.

use livesync_engine::{EngineConfig, ListenerConfig};
use uuid::Uuid;

/// Default prefix of the notification channel.
pub const DEFAULT_NOTIFY_PREFIX: &str = "livesync_";

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Id of this server process. Triggers notify the channel derived from it.
    pub app_id: String,
    /// Prefix of the notification channel.
    pub notify_prefix: String,
    /// Subscription and sync settings.
    pub engine: EngineConfig,
    /// Change feed reconnect settings.
    pub listener: ListenerConfig,
    /// Whether schema change notifications are logged.
    pub watch_schema: bool,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ServerConfig {
    /// Creates a configuration with a fresh app id.
    pub fn new() -> Self {
        Self {
            app_id: Uuid::new_v4().simple().to_string(),
            notify_prefix: DEFAULT_NOTIFY_PREFIX.to_string(),
            engine: EngineConfig::default(),
            listener: ListenerConfig::default(),
            watch_schema: false,
            max_connections: 1000,
        }
    }

    /// Sets the app id.
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Sets the notification channel prefix.
    pub fn with_notify_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.notify_prefix = prefix.into();
        self
    }

    /// Sets the engine configuration.
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the listener configuration.
    pub fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listener = listener;
        self
    }

    /// Enables or disables schema watching.
    pub fn with_watch_schema(mut self, watch: bool) -> Self {
        self.watch_schema = watch;
        self
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Channel this process listens on.
    pub fn notification_channel(&self) -> String {
        format!("{}{}", self.notify_prefix, self.app_id)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.notify_prefix, "livesync_");
        assert_eq!(config.app_id.len(), 32);
        assert!(!config.watch_schema);
        assert_eq!(config.listener.max_attempts, 10);
    }

    #[test]
    fn app_ids_differ_per_process() {
        assert_ne!(ServerConfig::new().app_id, ServerConfig::new().app_id);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_app_id("app1")
            .with_notify_prefix("ls_")
            .with_engine(EngineConfig::default().with_batch_size(10))
            .with_listener(ListenerConfig::new(3).with_retry_delay(Duration::from_millis(1)))
            .with_watch_schema(true)
            .with_max_connections(2);

        assert_eq!(config.notification_channel(), "ls_app1");
        assert_eq!(config.engine.batch_size, 10);
        assert_eq!(config.listener.max_attempts, 3);
        assert!(config.watch_schema);
        assert_eq!(config.max_connections, 2);
    }
}
