//! Device configuration.
//!
//! Values are plain data built by the host; nothing here is persisted.

use std::time::Duration;

use crate::mesh::MeshCredentials;

/// Default number of retries after a failed attempt.
pub const DEFAULT_RETRY_COUNT: u8 = 3;

/// Lowest accepted retry count.
pub const MIN_RETRY_COUNT: u8 = 1;

/// Highest accepted retry count.
pub const MAX_RETRY_COUNT: u8 = 5;

/// Delay between attempts of a retried operation.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);

/// Idle time after the last successful operation before disconnecting.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between frames of a multi-frame send.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(400);

/// How long `update` waits for a decoded status.
pub const DEFAULT_NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between writing the mesh pair request and reading the reply.
pub const DEFAULT_PAIR_DELAY: Duration = Duration::from_millis(300);

/// Default host polling interval.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Lowest accepted polling interval.
pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Highest accepted polling interval.
pub const MAX_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for a device facade and its session.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Retries after a failed attempt, within `MIN_RETRY_COUNT..=MAX_RETRY_COUNT`.
    retry_count: u8,
    /// Delay between attempts.
    backoff: Duration,
    /// Disconnect after this much idle time.
    idle_timeout: Duration,
    /// Pause between frames of a multi-frame send.
    settle_delay: Duration,
    /// Bound on waiting for a status notification.
    notification_timeout: Duration,
    /// Pause between mesh pair write and read.
    pair_delay: Duration,
    /// Interval at which the host is expected to call `update`.
    update_interval: Duration,
    /// Credentials for the encrypted mesh variant.
    mesh: MeshCredentials,
}

impl DeviceConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            backoff: DEFAULT_BACKOFF,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            notification_timeout: DEFAULT_NOTIFICATION_TIMEOUT,
            pair_delay: DEFAULT_PAIR_DELAY,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            mesh: MeshCredentials::default(),
        }
    }

    /// Retries after a failed attempt.
    #[must_use]
    pub const fn retry_count(&self) -> u8 {
        self.retry_count
    }

    /// Delay between attempts.
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Idle disconnect delay.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Pause between frames of a multi-frame send.
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Bound on waiting for a status notification.
    #[must_use]
    pub const fn notification_timeout(&self) -> Duration {
        self.notification_timeout
    }

    /// Pause between mesh pair write and read.
    #[must_use]
    pub const fn pair_delay(&self) -> Duration {
        self.pair_delay
    }

    /// Host polling interval.
    #[must_use]
    pub const fn update_interval(&self) -> Duration {
        self.update_interval
    }

    /// Mesh credentials.
    #[must_use]
    pub const fn mesh(&self) -> &MeshCredentials {
        &self.mesh
    }

    /// Sets the retry count, clamped to the accepted range.
    #[must_use]
    pub fn with_retry_count(mut self, count: u8) -> Self {
        self.retry_count = count.clamp(MIN_RETRY_COUNT, MAX_RETRY_COUNT);
        self
    }

    /// Sets the backoff between attempts.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the idle disconnect delay.
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the pause between frames.
    #[must_use]
    pub const fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Sets the status notification timeout.
    #[must_use]
    pub const fn with_notification_timeout(mut self, timeout: Duration) -> Self {
        self.notification_timeout = timeout;
        self
    }

    /// Sets the mesh pairing delay.
    #[must_use]
    pub const fn with_pair_delay(mut self, delay: Duration) -> Self {
        self.pair_delay = delay;
        self
    }

    /// Sets the polling interval, clamped to the accepted range.
    #[must_use]
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval.clamp(MIN_UPDATE_INTERVAL, MAX_UPDATE_INTERVAL);
        self
    }

    /// Sets the mesh credentials.
    #[must_use]
    pub fn with_mesh(mut self, credentials: MeshCredentials) -> Self {
        self.mesh = credentials;
        self
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = DeviceConfig::new();
        assert_eq!(config.retry_count(), DEFAULT_RETRY_COUNT);
        assert_eq!(config.backoff(), Duration::from_millis(250));
        assert_eq!(config.idle_timeout(), Duration::from_secs(10));
        assert_eq!(config.notification_timeout(), Duration::from_secs(2));
        assert_eq!(*config.mesh(), MeshCredentials::default());
    }

    #[test]
    fn test_retry_count_clamped() {
        assert_eq!(DeviceConfig::new().with_retry_count(0).retry_count(), MIN_RETRY_COUNT);
        assert_eq!(DeviceConfig::new().with_retry_count(9).retry_count(), MAX_RETRY_COUNT);
        assert_eq!(DeviceConfig::new().with_retry_count(2).retry_count(), 2);
    }

    #[test]
    fn test_update_interval_clamped() {
        let config = DeviceConfig::new().with_update_interval(Duration::from_secs(1));
        assert_eq!(config.update_interval(), MIN_UPDATE_INTERVAL);
        let config = DeviceConfig::new().with_update_interval(Duration::from_secs(600));
        assert_eq!(config.update_interval(), MAX_UPDATE_INTERVAL);
    }

    #[test]
    fn test_config_builder() {
        let config = DeviceConfig::new()
            .with_idle_timeout(Duration::from_secs(3))
            .with_settle_delay(Duration::ZERO)
            .with_backoff(Duration::from_millis(5));
        assert_eq!(config.idle_timeout(), Duration::from_secs(3));
        assert_eq!(config.settle_delay(), Duration::ZERO);
        assert_eq!(config.backoff(), Duration::from_millis(5));
    }
}
