//! Worker configuration
//!
//! All knobs come from the environment with production-safe defaults;
//! only the database DSN is mandatory.

use std::time::Duration;

use crate::backoff::BackoffConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Connection descriptor for the shared job store
    pub db_dsn: String,

    /// Identity recorded in `locked_by` on every claimed lease
    pub worker_id: String,

    /// Tick cadence of the poll loop
    pub poll_interval: Duration,

    /// Lease duration applied on claim. Must exceed the worst-case
    /// work latency plus one poll interval, or the work body may run
    /// twice (settlement stays exactly-once regardless).
    pub lease: Duration,

    /// Executor tasks
    pub pool_size: usize,

    /// Bounded queue capacity between the poll loop and the executors
    pub queue_size: usize,

    /// Retry delay ladder
    pub backoff: BackoffConfig,

    /// Demo failure-injection probability
    pub fail_rate: f64,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// - DB_DSN (required)
    /// - WORKER_ID (default: worker-1)
    /// - POLL_INTERVAL_MS (default: 500)
    /// - LEASE_SECONDS (default: 30)
    /// - WORKER_POOL_SIZE (default: 4)
    /// - JOB_QUEUE_SIZE (default: 100)
    /// - BACKOFF_BASE_MS (default: 500)
    /// - BACKOFF_MAX_MS (default: 30000)
    /// - BACKOFF_JITTER (default: 0.20)
    /// - FAIL_RATE (default: 0.30)
    pub fn from_env() -> anyhow::Result<Self> {
        let db_dsn = std::env::var("DB_DSN")
            .map_err(|_| anyhow::anyhow!("DB_DSN environment variable not set"))?;

        Ok(Self {
            db_dsn,
            worker_id: env_or("WORKER_ID", "worker-1"),
            poll_interval: Duration::from_millis(env_parse("POLL_INTERVAL_MS", 500u64)),
            lease: Duration::from_secs(env_parse("LEASE_SECONDS", 30u64)),
            pool_size: env_parse("WORKER_POOL_SIZE", 4usize),
            queue_size: env_parse("JOB_QUEUE_SIZE", 100usize),
            backoff: BackoffConfig {
                base: Duration::from_millis(env_parse("BACKOFF_BASE_MS", 500u64)),
                max: Duration::from_millis(env_parse("BACKOFF_MAX_MS", 30_000u64)),
                jitter: env_parse("BACKOFF_JITTER", 0.20f64),
            },
            fail_rate: env_parse("FAIL_RATE", 0.30f64),
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }
        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }
        if self.lease.is_zero() {
            anyhow::bail!("lease must be greater than 0");
        }
        if self.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than 0");
        }
        if self.queue_size == 0 {
            anyhow::bail!("queue_size must be greater than 0");
        }
        if self.backoff.jitter < 0.0 {
            anyhow::bail!("backoff jitter cannot be negative");
        }
        if !(0.0..=1.0).contains(&self.fail_rate) {
            anyhow::bail!("fail_rate must be within [0, 1]");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_dsn: "postgres://localhost:5432/conveyor".to_string(),
            worker_id: "worker-1".to_string(),
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(30),
            pool_size: 4,
            queue_size: 100,
            backoff: BackoffConfig {
                base: Duration::from_millis(500),
                max: Duration::from_millis(30_000),
                jitter: 0.20,
            },
            fail_rate: 0.30,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.worker_id, "worker-1");
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.lease, Duration::from_secs(30));
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.queue_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.worker_id = String::new();
        assert!(config.validate().is_err());
        config.worker_id = "w1".to_string();

        config.pool_size = 0;
        assert!(config.validate().is_err());
        config.pool_size = 4;

        config.fail_rate = 1.5;
        assert!(config.validate().is_err());
        config.fail_rate = 0.3;

        assert!(config.validate().is_ok());
    }
}
