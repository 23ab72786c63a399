//! Configuration types, read from the environment with defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default HTTP / WebSocket port.
const DEFAULT_PORT: u16 = 3001;

/// Ingestion pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum messages classified per drain batch.
    pub batch_size: usize,
    /// Token bucket capacity for classifier calls.
    pub rate_capacity: u32,
    /// Token bucket refill period.
    pub refill_period: Duration,
    /// First wait of the limiter's exponential backoff.
    pub rate_backoff_initial: Duration,
    /// Ceiling of the limiter's exponential backoff.
    pub rate_backoff_max: Duration,
    /// Watch loop poll interval.
    pub poll_interval: Duration,
    /// Delay before re-draining after a failed batch.
    pub retry_initial: Duration,
    /// Ceiling for the failed-batch retry delay.
    pub retry_max: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            rate_capacity: 50,
            refill_period: Duration::from_secs(60),
            rate_backoff_initial: Duration::from_secs(1),
            rate_backoff_max: Duration::from_secs(30),
            poll_interval: Duration::from_secs(60),
            retry_initial: Duration::from_secs(5),
            retry_max: Duration::from_secs(300),
        }
    }
}

impl PipelineConfig {
    /// Build from `INBOX_TASKS_*` variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_or("INBOX_TASKS_BATCH_SIZE", defaults.batch_size),
            rate_capacity: env_or("INBOX_TASKS_RATE_CAPACITY", defaults.rate_capacity),
            refill_period: env_secs("INBOX_TASKS_RATE_PERIOD_SECS", defaults.refill_period),
            rate_backoff_initial: defaults.rate_backoff_initial,
            rate_backoff_max: defaults.rate_backoff_max,
            poll_interval: env_secs("INBOX_TASKS_POLL_INTERVAL_SECS", defaults.poll_interval),
            retry_initial: env_secs("INBOX_TASKS_RETRY_INITIAL_SECS", defaults.retry_initial),
            retry_max: env_secs("INBOX_TASKS_RETRY_MAX_SECS", defaults.retry_max),
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "INBOX_TASKS_BATCH_SIZE".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.rate_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "INBOX_TASKS_RATE_CAPACITY".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.refill_period.is_zero() || self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "INBOX_TASKS_*_SECS".into(),
                message: "periods must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Live-update publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Heartbeat check interval; unacknowledged subscribers are dropped on the next check.
    pub heartbeat_interval: Duration,
    /// Per-subscriber outbound buffer. A full buffer means "not ready" and the event is skipped.
    pub subscriber_buffer: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            subscriber_buffer: 64,
        }
    }
}

impl PublisherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            heartbeat_interval: env_secs(
                "INBOX_TASKS_HEARTBEAT_SECS",
                defaults.heartbeat_interval,
            ),
            subscriber_buffer: env_or("INBOX_TASKS_SUBSCRIBER_BUFFER", defaults.subscriber_buffer)
                .max(1),
        }
    }

    /// A zero heartbeat interval would make the heartbeat ticker panic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "INBOX_TASKS_HEARTBEAT_SECS".into(),
                message: "must be non-zero".into(),
            });
        }
        if self.subscriber_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "INBOX_TASKS_SUBSCRIBER_BUFFER".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP + WebSocket listen port.
    pub port: u16,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// When set, logs are also written to a daily-rolling file here.
    pub log_dir: Option<PathBuf>,
    pub pipeline: PipelineConfig,
    pub publisher: PublisherConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_or("INBOX_TASKS_PORT", DEFAULT_PORT),
            db_path: std::env::var("INBOX_TASKS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/inbox-tasks.db")),
            log_dir: std::env::var("INBOX_TASKS_LOG_DIR").ok().map(PathBuf::from),
            pipeline: PipelineConfig::from_env(),
            publisher: PublisherConfig::from_env(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;
        self.publisher.validate()
    }
}

/// Parse an environment variable, using `default` when unset or unparsable.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
