use std::env;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub dispatch: DispatchConfig,
    pub provider: ProviderConfig,
    pub outbox: OutboxConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Ceiling on concurrent send tasks in the worker pool.
    pub max_concurrent_workers: usize,
    /// Capacity of each priority lane in the in-memory queue.
    pub queue_capacity: usize,
    /// Queue depth at which /health reports degraded.
    pub queue_degraded_threshold: usize,
    /// When false, a full queue sheds the intake with 503 instead of blocking.
    pub blocking_enqueue: bool,
    /// Base (seconds) for the worker retry backoff: base * 2^retry_count.
    pub retry_base_seconds: u64,
    /// Backoff cap in seconds.
    pub retry_max_backoff_seconds: u64,
    /// Default max_retries stamped on new notifications.
    pub retry_max: i32,
    /// Delay before the simulated delivery confirmation fires.
    pub delivery_confirm_delay: Duration,
    /// Scheduler sweep resolution.
    pub scheduler_tick: Duration,
    /// How often the releaser promotes due scheduled notifications.
    pub releaser_interval: Duration,
    /// Age after which a stuck 'processing' row is reclaimed.
    pub stuck_processing_after: Duration,
    /// Refund quota counters when a pending notification is cancelled.
    pub quota_refund_on_cancel: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Hard cap per outer send call, including in-call retries.
    pub timeout: Duration,
    /// Extra attempts inside a single send call on transient errors.
    pub retry_attempts: u32,
    /// Base delay for the in-call retry backoff.
    pub retry_base: Duration,
    /// Failure ratio at which the circuit opens.
    pub circuit_failure_ratio: f64,
    /// Sliding window over which the ratio is computed.
    pub circuit_window: Duration,
    /// Minimum calls in the window before the ratio is consulted.
    pub circuit_min_throughput: usize,
    /// How long an open circuit rejects before probing.
    pub circuit_break: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    /// Rows claimed per dispatcher poll.
    pub batch_size: i64,
    /// Delivery attempts before a row is dead-lettered.
    pub max_attempts: i32,
    /// Dispatcher poll interval when idle.
    pub poll_interval: Duration,
    /// Webhook POST timeout.
    pub webhook_timeout: Duration,
    /// In-call webhook retry attempts.
    pub webhook_retry_attempts: u32,
    /// Base delay for webhook retry backoff.
    pub webhook_retry_base: Duration,
    /// Consecutive failures after which a webhook is deactivated.
    pub webhook_max_failures: i32,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/dispatch.db".to_string()),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
            },
            dispatch: DispatchConfig {
                max_concurrent_workers: env_parse("MAX_CONCURRENT_WORKERS", 10),
                queue_capacity: env_parse("QUEUE_CAPACITY", 10_000),
                queue_degraded_threshold: env_parse("QUEUE_DEGRADED_THRESHOLD", 10_000),
                blocking_enqueue: env_bool("QUEUE_BLOCKING_ENQUEUE", false),
                retry_base_seconds: env_parse("RETRY_BASE_SECONDS", 5),
                retry_max_backoff_seconds: env_parse("RETRY_MAX_BACKOFF_SECONDS", 900),
                retry_max: env_parse("RETRY_MAX", 3),
                delivery_confirm_delay: Duration::from_millis(env_parse(
                    "DELIVERY_CONFIRM_DELAY_MS",
                    2_000,
                )),
                scheduler_tick: Duration::from_millis(env_parse("SCHEDULER_TICK_MS", 100)),
                releaser_interval: Duration::from_secs(env_parse("RELEASER_INTERVAL_SECONDS", 10)),
                stuck_processing_after: Duration::from_secs(env_parse(
                    "STUCK_PROCESSING_AFTER_SECONDS",
                    300,
                )),
                quota_refund_on_cancel: env_bool("QUOTA_REFUND_ON_CANCEL", false),
            },
            provider: ProviderConfig {
                timeout: Duration::from_secs(env_parse("PROVIDER_TIMEOUT_SECONDS", 10)),
                retry_attempts: env_parse("PROVIDER_RETRY_ATTEMPTS", 2),
                retry_base: Duration::from_millis(env_parse("PROVIDER_RETRY_BASE_MS", 200)),
                circuit_failure_ratio: env_parse("CIRCUIT_FAILURE_RATIO", 0.5),
                circuit_window: Duration::from_secs(env_parse("CIRCUIT_WINDOW_SECONDS", 30)),
                circuit_min_throughput: env_parse("CIRCUIT_MIN_THROUGHPUT", 5),
                circuit_break: Duration::from_secs(env_parse("CIRCUIT_BREAK_SECONDS", 30)),
            },
            outbox: OutboxConfig {
                batch_size: env_parse("OUTBOX_BATCH", 100),
                max_attempts: env_parse("OUTBOX_MAX_ATTEMPTS", 5),
                poll_interval: Duration::from_millis(env_parse("OUTBOX_POLL_INTERVAL_MS", 1_000)),
                webhook_timeout: Duration::from_secs(env_parse("WEBHOOK_TIMEOUT_SECONDS", 10)),
                webhook_retry_attempts: env_parse("WEBHOOK_RETRY_ATTEMPTS", 3),
                webhook_retry_base: Duration::from_millis(env_parse(
                    "WEBHOOK_RETRY_BASE_MS",
                    1_000,
                )),
                webhook_max_failures: env_parse("WEBHOOK_MAX_FAILURES", 10),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://data/dispatch.db".to_string(),
                max_connections: 5,
            },
            dispatch: DispatchConfig {
                max_concurrent_workers: 10,
                queue_capacity: 10_000,
                queue_degraded_threshold: 10_000,
                blocking_enqueue: false,
                retry_base_seconds: 5,
                retry_max_backoff_seconds: 900,
                retry_max: 3,
                delivery_confirm_delay: Duration::from_secs(2),
                scheduler_tick: Duration::from_millis(100),
                releaser_interval: Duration::from_secs(10),
                stuck_processing_after: Duration::from_secs(300),
                quota_refund_on_cancel: false,
            },
            provider: ProviderConfig {
                timeout: Duration::from_secs(10),
                retry_attempts: 2,
                retry_base: Duration::from_millis(200),
                circuit_failure_ratio: 0.5,
                circuit_window: Duration::from_secs(30),
                circuit_min_throughput: 5,
                circuit_break: Duration::from_secs(30),
            },
            outbox: OutboxConfig {
                batch_size: 100,
                max_attempts: 5,
                poll_interval: Duration::from_secs(1),
                webhook_timeout: Duration::from_secs(10),
                webhook_retry_attempts: 3,
                webhook_retry_base: Duration::from_secs(1),
                webhook_max_failures: 10,
            },
        }
    }
}
