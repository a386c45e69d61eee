//! PostgreSQL backend configuration.

use crate::error::{PgError, PgResult};
use crate::sql::validate_identifier;
use std::time::Duration;

/// Default bookkeeping schema.
pub const DEFAULT_SCHEMA: &str = "livesync";

/// Configuration for the PostgreSQL backend.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// Connection URL.
    pub database_url: String,
    /// Schema holding the bookkeeping tables and functions.
    pub schema: String,
    /// Prefix of app notification channels.
    pub notify_prefix: String,
    /// How often the app reports itself alive.
    pub heartbeat_interval: Duration,
    /// Pool size.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
    /// Whether this app receives schema change notifications.
    pub watch_schema: bool,
    /// Whether to run the install SQL on connect.
    pub install: bool,
}

impl PgConfig {
    /// Creates a configuration with default values.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            notify_prefix: "livesync_".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
            watch_schema: false,
            install: false,
        }
    }

    /// Sets the bookkeeping schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Sets the notification channel prefix.
    pub fn with_notify_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.notify_prefix = prefix.into();
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the pool size.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the pool acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Enables or disables schema watching.
    pub fn with_watch_schema(mut self, watch: bool) -> Self {
        self.watch_schema = watch;
        self
    }

    /// Enables or disables installing on connect.
    pub fn with_install(mut self, install: bool) -> Self {
        self.install = install;
        self
    }

    /// Checks names that end up in generated SQL and the heartbeat period.
    pub fn validate(&self) -> PgResult<()> {
        validate_identifier(&self.schema)?;
        validate_identifier(&self.notify_prefix)?;
        if self.heartbeat_interval.is_zero() {
            return Err(PgError::InvalidConfig(
                "heartbeat interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Heartbeat period in milliseconds, as stored in the apps table.
    pub fn heartbeat_ms(&self) -> i32 {
        i32::try_from(self.heartbeat_interval.as_millis()).unwrap_or(i32::MAX)
    }
}

impl Default for PgConfig {
    fn default() -> Self {
        Self::new("postgres://localhost/postgres")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = PgConfig::default();
        assert_eq!(config.schema, "livesync");
        assert_eq!(config.heartbeat_ms(), 10_000);
        assert!(!config.install);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_builder() {
        let config = PgConfig::new("postgres://db/app")
            .with_schema("ls")
            .with_notify_prefix("ls_")
            .with_heartbeat_interval(Duration::from_millis(500))
            .with_max_connections(2)
            .with_watch_schema(true)
            .with_install(true);

        assert_eq!(config.database_url, "postgres://db/app");
        assert_eq!(config.schema, "ls");
        assert_eq!(config.heartbeat_ms(), 500);
        assert_eq!(config.max_connections, 2);
        assert!(config.watch_schema);
        assert!(config.install);
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(PgConfig::default().with_schema("a; DROP").validate().is_err());
        assert!(PgConfig::default()
            .with_notify_prefix("Bad-Prefix")
            .validate()
            .is_err());
        assert!(PgConfig::default()
            .with_heartbeat_interval(Duration::ZERO)
            .validate()
            .is_err());
    }
}
