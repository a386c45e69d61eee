//! Configuration for the live sync engine.

use std::time::Duration;

/// Default prefix of subscription and sync channel names.
pub const DEFAULT_CHANNEL_PREFIX: &str = "_livesync_";

/// Default number of rows per sync page and write-buffer batch.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Configuration shared by subscriptions and syncs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix of channel names handed to clients.
    pub channel_prefix: String,
    /// Rows per sync page when the table rules do not set one.
    pub batch_size: usize,
    /// Minimum spacing between subscription pushes when the rules do not set one.
    pub subscription_throttle: Duration,
    /// Bound on client round trips. `None` waits forever.
    pub client_timeout: Option<Duration>,
    /// How long applied client writes are remembered to avoid echoing them back.
    pub history_age: Duration,
    /// After a trigger condition on a table is added or removed, change
    /// notifications for that table reach every subscription on it for this
    /// long, since their condition positions may predate the change.
    pub condition_settle: Duration,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            subscription_throttle: Duration::from_millis(10),
            client_timeout: Some(Duration::from_secs(30)),
            history_age: Duration::from_secs(2),
            condition_settle: Duration::from_secs(1),
        }
    }

    /// Sets the channel prefix.
    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    /// Sets the default batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the default subscription throttle.
    pub fn with_subscription_throttle(mut self, throttle: Duration) -> Self {
        self.subscription_throttle = throttle;
        self
    }

    /// Sets the client round-trip timeout.
    pub fn with_client_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// Sets how long applied client writes are remembered.
    pub fn with_history_age(mut self, age: Duration) -> Self {
        self.history_age = age;
        self
    }

    /// Sets how long notifications fan out to a whole table after its
    /// conditions change.
    pub fn with_condition_settle(mut self, settle: Duration) -> Self {
        self.condition_settle = settle;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconnect behavior of the change feed listener.
///
/// Reconnects are spaced by a fixed delay. Once `max_attempts` consecutive
/// connection attempts have failed the listener gives up.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
}

impl ListenerConfig {
    /// Creates a configuration with `max_attempts` and the default delay.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Sets the delay between attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Delay before attempt `attempt` (0-indexed). The first attempt is immediate.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.retry_delay
        }
    }

    /// Total time spent waiting before giving up.
    pub fn give_up_after(&self) -> Duration {
        self.retry_delay * self.max_attempts
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::new()
            .with_channel_prefix("app")
            .with_batch_size(10)
            .with_subscription_throttle(Duration::from_millis(100))
            .with_client_timeout(None)
            .with_history_age(Duration::from_secs(5));

        assert_eq!(config.channel_prefix, "app");
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.subscription_throttle, Duration::from_millis(100));
        assert_eq!(config.client_timeout, None);
        assert_eq!(config.history_age, Duration::from_secs(5));
    }

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.channel_prefix, "_livesync_");
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.subscription_throttle, Duration::from_millis(10));
        assert_eq!(config.client_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.history_age, Duration::from_secs(2));
    }

    #[test]
    fn listener_delays_are_fixed() {
        let config = ListenerConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(9), Duration::from_secs(5));
        assert_eq!(config.give_up_after(), Duration::from_secs(50));
    }
}
