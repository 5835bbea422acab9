//! Aggregator configuration from environment variables

use super::ingestion::ConsumerConfig;
use super::reconciler::ReconcilerConfig;
use super::scheduler::SyncTrigger;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Configuration for the aggregator daemon
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// SQLite file shared by queue, buffer and durable store
    pub db_path: String,

    /// Inbound record queue
    pub queue: String,

    /// Where records go after exhausting their retries
    pub dead_letter_queue: String,

    /// Durable stats namespace
    pub bucket: String,

    pub pop_timeout_ms: u64,

    /// Status line interval
    pub status_interval_ms: u64,

    /// Failed deliveries tolerated before dead-lettering
    pub max_retries: u32,

    /// Completion marker lifetime
    pub completion_ttl_ms: u64,

    /// Dirty-set size that forces a sync sweep
    pub sync_high_water: usize,

    /// Maximum time between sync sweeps
    pub sync_interval_ms: u64,

    pub reconcile_max_attempts: u32,
    pub reconcile_read_retries: u32,
}

impl AggregatorConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `HYPERSTATS_DB_PATH` (default: data/hyperstats.db)
    /// - `HYPERSTATS_QUEUE` (default: aggqueue)
    /// - `HYPERSTATS_DEAD_LETTER_QUEUE` (default: aggqueue:dead)
    /// - `HYPERSTATS_BUCKET` (default: stats)
    /// - `HYPERSTATS_POP_TIMEOUT_MS` (default: 1000)
    /// - `HYPERSTATS_STATUS_INTERVAL_MS` (default: 2000)
    /// - `HYPERSTATS_MAX_RETRIES` (default: 3)
    /// - `HYPERSTATS_COMPLETION_TTL_MS` (default: 2000)
    /// - `HYPERSTATS_SYNC_HIGH_WATER` (default: 5000)
    /// - `HYPERSTATS_SYNC_INTERVAL_MS` (default: 60000)
    /// - `HYPERSTATS_RECONCILE_MAX_ATTEMPTS` (default: 64)
    /// - `HYPERSTATS_RECONCILE_READ_RETRIES` (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable lookup
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            db_path: text("HYPERSTATS_DB_PATH", "data/hyperstats.db"),
            queue: text("HYPERSTATS_QUEUE", "aggqueue"),
            dead_letter_queue: text("HYPERSTATS_DEAD_LETTER_QUEUE", "aggqueue:dead"),
            bucket: text("HYPERSTATS_BUCKET", "stats"),
            pop_timeout_ms: parse_or(&lookup, "HYPERSTATS_POP_TIMEOUT_MS", 1_000),
            status_interval_ms: parse_or(&lookup, "HYPERSTATS_STATUS_INTERVAL_MS", 2_000),
            max_retries: parse_or(&lookup, "HYPERSTATS_MAX_RETRIES", 3),
            completion_ttl_ms: parse_or(&lookup, "HYPERSTATS_COMPLETION_TTL_MS", 2_000),
            sync_high_water: parse_or(&lookup, "HYPERSTATS_SYNC_HIGH_WATER", 5_000),
            sync_interval_ms: parse_or(&lookup, "HYPERSTATS_SYNC_INTERVAL_MS", 60_000),
            reconcile_max_attempts: parse_or(&lookup, "HYPERSTATS_RECONCILE_MAX_ATTEMPTS", 64),
            reconcile_read_retries: parse_or(&lookup, "HYPERSTATS_RECONCILE_READ_RETRIES", 5),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.is_empty() {
            return Err(ConfigError::Empty("HYPERSTATS_QUEUE"));
        }
        if self.dead_letter_queue.is_empty() {
            return Err(ConfigError::Empty("HYPERSTATS_DEAD_LETTER_QUEUE"));
        }
        if self.sync_high_water == 0 {
            return Err(ConfigError::Zero("HYPERSTATS_SYNC_HIGH_WATER"));
        }
        if self.reconcile_max_attempts == 0 {
            return Err(ConfigError::Zero("HYPERSTATS_RECONCILE_MAX_ATTEMPTS"));
        }
        if self.reconcile_read_retries == 0 {
            return Err(ConfigError::Zero("HYPERSTATS_RECONCILE_READ_RETRIES"));
        }
        Ok(())
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            queue: self.queue.clone(),
            dead_letter_queue: self.dead_letter_queue.clone(),
            pop_timeout: Duration::from_millis(self.pop_timeout_ms),
            max_retries: self.max_retries,
            completion_ttl: Duration::from_millis(self.completion_ttl_ms),
            ..ConsumerConfig::default()
        }
    }

    pub fn sync_trigger(&self) -> SyncTrigger {
        SyncTrigger {
            high_water: self.sync_high_water,
            interval: Duration::from_millis(self.sync_interval_ms),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            max_attempts: self.reconcile_max_attempts,
            max_read_retries: self.reconcile_read_retries,
            ..ReconcilerConfig::default()
        }
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    /// One line per setting at startup
    pub fn log_banner(&self) {
        log::info!("⚙️  Aggregator configuration:");
        log::info!("   ├─ Database: {}", self.db_path);
        log::info!("   ├─ Queue: {} (dead letters: {})", self.queue, self.dead_letter_queue);
        log::info!("   ├─ Bucket: {}", self.bucket);
        log::info!("   ├─ Pop timeout: {}ms", self.pop_timeout_ms);
        log::info!("   ├─ Status interval: {}ms", self.status_interval_ms);
        log::info!("   ├─ Max retries: {}", self.max_retries);
        log::info!("   ├─ Completion TTL: {}ms", self.completion_ttl_ms);
        log::info!("   ├─ Sync: {} dirty facets or {}ms", self.sync_high_water, self.sync_interval_ms);
        log::info!(
            "   └─ Reconcile: {} attempts, {} read retries",
            self.reconcile_max_attempts,
            self.reconcile_read_retries
        );
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("⚠️  {}={:?} is not a valid number, using {}", key, raw, default);
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        // Test: Default configuration when no variables are set
        let config = AggregatorConfig::from_source(source(&[])).unwrap();

        assert_eq!(config.db_path, "data/hyperstats.db");
        assert_eq!(config.queue, "aggqueue");
        assert_eq!(config.dead_letter_queue, "aggqueue:dead");
        assert_eq!(config.bucket, "stats");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.sync_high_water, 5_000);

        let trigger = config.sync_trigger();
        assert_eq!(trigger.interval, Duration::from_secs(60));

        let consumer = config.consumer_config();
        assert_eq!(consumer.pop_timeout, Duration::from_secs(1));
        assert_eq!(consumer.completion_ttl, Duration::from_secs(2));
    }

    #[test]
    fn test_custom_config() {
        let config = AggregatorConfig::from_source(source(&[
            ("HYPERSTATS_DB_PATH", "/tmp/test.db"),
            ("HYPERSTATS_QUEUE", "q"),
            ("HYPERSTATS_MAX_RETRIES", "5"),
            ("HYPERSTATS_SYNC_HIGH_WATER", "10"),
            ("HYPERSTATS_RECONCILE_MAX_ATTEMPTS", "7"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.consumer_config().queue, "q");
        assert_eq!(config.consumer_config().max_retries, 5);
        assert_eq!(config.sync_trigger().high_water, 10);
        assert_eq!(config.reconciler_config().max_attempts, 7);
    }

    #[test]
    fn test_invalid_number_falls_back() {
        let config = AggregatorConfig::from_source(source(&[("HYPERSTATS_POP_TIMEOUT_MS", "soon")])).unwrap();
        assert_eq!(config.pop_timeout_ms, 1_000);
    }

    #[test]
    fn test_zero_bounds_rejected() {
        let err = AggregatorConfig::from_source(source(&[("HYPERSTATS_SYNC_HIGH_WATER", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("HYPERSTATS_SYNC_HIGH_WATER")));

        let err = AggregatorConfig::from_source(source(&[("HYPERSTATS_RECONCILE_READ_RETRIES", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Zero(_)));
    }
}
