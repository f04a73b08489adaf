//! Engine configuration.

use std::time::Duration;

/// Configuration for a Tessera database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum payload bytes carried by a single WAL chunk record.
    pub chunk_size: usize,

    /// Whether to flush the WAL after each commit or rollback record.
    pub sync_on_write: bool,

    /// Transactions whose start is older than this are force-rolled-back.
    pub stale_transaction_timeout: Duration,

    /// How often the stale-transaction sweep runs (zero disables it).
    pub sweep_interval: Duration,

    /// How often ordered maps are committed in the background (zero disables it).
    pub store_commit_interval: Duration,

    /// Minimum spacing between rebuild progress events.
    pub progress_interval: Duration,

    /// Retry policy for units of work that hit a transaction conflict.
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            sync_on_write: true,
            stale_transaction_timeout: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            store_commit_interval: Duration::from_secs(1),
            progress_interval: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the WAL chunk size (at least one byte).
    #[must_use]
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Sets whether to flush the WAL on commit and rollback.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the abandoned-transaction timeout.
    #[must_use]
    pub const fn stale_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.stale_transaction_timeout = timeout;
        self
    }

    /// Sets the stale-transaction sweep period.
    #[must_use]
    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the background map commit period.
    #[must_use]
    pub const fn store_commit_interval(mut self, interval: Duration) -> Self {
        self.store_commit_interval = interval;
        self
    }

    /// Sets the progress event throttle.
    #[must_use]
    pub const fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Bounded retry for units of work that fail with a transaction conflict.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per further attempt.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration with `max_attempts` attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before attempt number `attempt` (0-indexed; the first attempt never waits).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(
            config.stale_transaction_timeout,
            Duration::from_secs(86_400)
        );
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .chunk_size(0)
            .sync_on_write(false)
            .stale_transaction_timeout(Duration::from_secs(5));

        assert_eq!(config.chunk_size, 1);
        assert!(!config.sync_on_write);
        assert_eq!(config.stale_transaction_timeout, Duration::from_secs(5));
    }

    #[test]
    fn retry_delays_back_off_and_cap() {
        let retry = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(250));

        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(250));
    }

    #[test]
    fn retry_needs_at_least_one_attempt() {
        assert_eq!(RetryConfig::new(0).max_attempts, 1);
    }
}
