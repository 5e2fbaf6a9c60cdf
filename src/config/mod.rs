//! Runtime settings.
//!
//! Everything is environment-driven with defaults; `Settings::from_env` is
//! called once in `main` before any component starts, and the snapshot is
//! the only process-global state besides the tracing subscriber.

use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::IngestError;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

/// How message bodies reach the sink: raw source pass-through (downstream
/// owns MIME decoding) or fully parsed with attachments extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Raw,
    Full,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite configuration/status store path.
    pub database_path: PathBuf,
    /// Durable queue submission endpoint.
    pub sink_url: String,
    /// Observability bind address.
    pub http_addr: String,

    /// Cap on scheduled mailboxes.
    pub max_concurrent_accounts: usize,
    /// Sessions per mailbox. The pool holds this at one; higher values are
    /// accepted from the environment but clamped.
    pub max_connections_per_account: usize,
    /// `C_host`: live sessions per host group.
    pub max_connections_per_server: usize,
    /// `W`: rolling rate window.
    pub rate_limit_window: Duration,
    /// `R_host`: new sessions per host per window.
    pub max_rate_limit: usize,

    pub max_workers: usize,
    /// Per-task deadline; also the stuck-worker threshold.
    pub worker_timeout: Duration,
    pub task_queue_size: usize,
    pub task_max_retries: u32,

    pub high_priority_interval: Duration,
    pub medium_priority_interval: Duration,
    pub low_priority_interval: Duration,
    pub max_consecutive_failures: u32,
    pub backoff_multiplier: f64,
    pub scheduler_tick_interval: Duration,

    /// IDLE startup deadline.
    pub idle_timeout: Duration,
    /// Keepalive cadence while idling.
    pub noop_interval: Duration,
    pub max_idle_failures: u32,
    /// Minimum gap between IDLE attempts for a mailbox.
    pub idle_retry_interval: Duration,

    pub mailbox_refresh_interval: Duration,
    pub shutdown_drain_timeout: Duration,
    pub pool_sweep_interval: Duration,
    pub pool_purge_interval: Duration,

    pub sink_max_batch: usize,
    pub max_message_bytes: usize,
    pub truncate_at_bytes: usize,
    pub parse_mode: ParseMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("mailpipe.db"),
            sink_url: "http://127.0.0.1:9324/queue".into(),
            http_addr: "127.0.0.1:8080".into(),
            max_concurrent_accounts: 10_000,
            max_connections_per_account: 1,
            max_connections_per_server: 50,
            rate_limit_window: Duration::from_secs(60),
            max_rate_limit: 200,
            max_workers: 50,
            worker_timeout: Duration::from_secs(300),
            task_queue_size: 10_000,
            task_max_retries: 2,
            high_priority_interval: Duration::from_secs(60),
            medium_priority_interval: Duration::from_secs(300),
            low_priority_interval: Duration::from_secs(900),
            max_consecutive_failures: 3,
            backoff_multiplier: 2.0,
            scheduler_tick_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            noop_interval: Duration::from_secs(30),
            max_idle_failures: 3,
            idle_retry_interval: Duration::from_secs(300),
            mailbox_refresh_interval: Duration::from_secs(60),
            shutdown_drain_timeout: Duration::from_secs(30),
            pool_sweep_interval: Duration::from_secs(300),
            pool_purge_interval: Duration::from_secs(600),
            sink_max_batch: 10,
            max_message_bytes: 256_000,
            truncate_at_bytes: 200_000,
            parse_mode: ParseMode::Raw,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, IngestError> {
        let defaults = Settings::default();

        let sink_url = std::env::var("SINK_URL")
            .map_err(|_| IngestError::Config("SINK_URL is required".into()))?;

        Ok(Self {
            database_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            sink_url,
            http_addr: env_string("HTTP_ADDR", &defaults.http_addr),
            max_concurrent_accounts: env_usize(
                "MAX_CONCURRENT_ACCOUNTS",
                defaults.max_concurrent_accounts,
            )?,
            max_connections_per_account: {
                let v = env_usize("MAX_CONNECTIONS_PER_ACCOUNT", 1)?;
                if v != 1 {
                    tracing::warn!(
                        requested = v,
                        "MAX_CONNECTIONS_PER_ACCOUNT is clamped to 1; sessions are exclusive per mailbox"
                    );
                }
                1
            },
            max_connections_per_server: env_usize(
                "MAX_CONNECTIONS_PER_SERVER",
                defaults.max_connections_per_server,
            )?,
            rate_limit_window: env_ms("RATE_LIMIT_WINDOW", defaults.rate_limit_window)?,
            max_rate_limit: env_usize("MAX_RATE_LIMIT", defaults.max_rate_limit)?,
            max_workers: env_usize("MAX_WORKERS", defaults.max_workers)?,
            worker_timeout: env_ms("WORKER_TIMEOUT", defaults.worker_timeout)?,
            task_queue_size: env_usize("TASK_QUEUE_SIZE", defaults.task_queue_size)?,
            task_max_retries: env_u32("TASK_MAX_RETRIES", defaults.task_max_retries)?,
            high_priority_interval: env_ms(
                "HIGH_PRIORITY_INTERVAL",
                defaults.high_priority_interval,
            )?,
            medium_priority_interval: env_ms(
                "MEDIUM_PRIORITY_INTERVAL",
                defaults.medium_priority_interval,
            )?,
            low_priority_interval: env_ms(
                "LOW_PRIORITY_INTERVAL",
                defaults.low_priority_interval,
            )?,
            max_consecutive_failures: env_u32(
                "MAX_CONSECUTIVE_FAILURES",
                defaults.max_consecutive_failures,
            )?,
            backoff_multiplier: env_f64("BACKOFF_MULTIPLIER", defaults.backoff_multiplier)?,
            scheduler_tick_interval: env_ms(
                "SCHEDULER_TICK_INTERVAL",
                defaults.scheduler_tick_interval,
            )?,
            idle_timeout: env_ms("IDLE_TIMEOUT", defaults.idle_timeout)?,
            noop_interval: env_ms("NOOP_INTERVAL", defaults.noop_interval)?,
            max_idle_failures: env_u32("MAX_IDLE_FAILURES", defaults.max_idle_failures)?,
            idle_retry_interval: env_ms("IDLE_RETRY_INTERVAL", defaults.idle_retry_interval)?,
            mailbox_refresh_interval: env_ms(
                "MAILBOX_REFRESH_INTERVAL",
                defaults.mailbox_refresh_interval,
            )?,
            shutdown_drain_timeout: env_ms(
                "SHUTDOWN_DRAIN_TIMEOUT",
                defaults.shutdown_drain_timeout,
            )?,
            pool_sweep_interval: env_ms("POOL_SWEEP_INTERVAL", defaults.pool_sweep_interval)?,
            pool_purge_interval: env_ms("POOL_PURGE_INTERVAL", defaults.pool_purge_interval)?,
            sink_max_batch: env_usize("SINK_MAX_BATCH", defaults.sink_max_batch)?.min(10),
            max_message_bytes: env_usize("MAX_MESSAGE_BYTES", defaults.max_message_bytes)?,
            truncate_at_bytes: env_usize("TRUNCATE_AT_BYTES", defaults.truncate_at_bytes)?,
            parse_mode: match std::env::var("PARSE_MODE").as_deref() {
                Ok("full") => ParseMode::Full,
                Ok("raw") | Err(_) => ParseMode::Raw,
                Ok(other) => {
                    return Err(IngestError::Config(format!(
                        "PARSE_MODE must be \"raw\" or \"full\", got {:?}",
                        other
                    )))
                }
            },
        })
    }

    /// Base interval for a priority tier.
    pub fn interval_for_priority(&self, priority: crate::types::Priority) -> Duration {
        match priority {
            crate::types::Priority::High => self.high_priority_interval,
            crate::types::Priority::Medium => self.medium_priority_interval,
            crate::types::Priority::Low => self.low_priority_interval,
        }
    }

    /// Interval for an observed volume tier.
    pub fn interval_for_volume(&self, tier: crate::types::VolumeTier) -> Duration {
        match tier {
            crate::types::VolumeTier::High => self.high_priority_interval,
            crate::types::VolumeTier::Medium => self.medium_priority_interval,
            crate::types::VolumeTier::Low => self.low_priority_interval,
        }
    }
}

/// Install the process-wide settings snapshot. Call once from `main`.
pub fn init(settings: Settings) -> &'static Settings {
    SETTINGS.get_or_init(|| settings)
}

/// The installed snapshot. Panics if `init` has not run; components should
/// prefer the `Arc<Settings>` threaded at construction.
pub fn get() -> &'static Settings {
    SETTINGS
        .get()
        .expect("settings not initialized — call config::init() first")
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> Result<usize, IngestError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| IngestError::Config(format!("{} must be an integer, got {:?}", key, v))),
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32, IngestError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| IngestError::Config(format!("{} must be an integer, got {:?}", key, v))),
        Err(_) => Ok(default),
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64, IngestError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| IngestError::Config(format!("{} must be a number, got {:?}", key, v))),
        Err(_) => Ok(default),
    }
}

fn env_ms(key: &str, default: Duration) -> Result<Duration, IngestError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| IngestError::Config(format!("{} must be milliseconds, got {:?}", key, v))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, VolumeTier};

    #[test]
    fn test_default_limits() {
        let s = Settings::default();
        assert_eq!(s.max_connections_per_server, 50);
        assert_eq!(s.max_rate_limit, 200);
        assert_eq!(s.rate_limit_window, Duration::from_secs(60));
        assert_eq!(s.max_workers, 50);
        assert_eq!(s.task_queue_size, 10_000);
        assert_eq!(s.sink_max_batch, 10);
        assert_eq!(s.max_consecutive_failures, 3);
        assert_eq!(s.max_idle_failures, 3);
    }

    #[test]
    fn test_interval_mappings() {
        let s = Settings::default();
        assert_eq!(s.interval_for_priority(Priority::High), Duration::from_secs(60));
        assert_eq!(s.interval_for_volume(VolumeTier::Medium), Duration::from_secs(300));
        assert_eq!(s.interval_for_volume(VolumeTier::Low), Duration::from_secs(900));
    }
}
