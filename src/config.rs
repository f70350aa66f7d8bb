use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{EngineConfig, RetryPolicy};

/// Process configuration, read once from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub hold_ttl: Duration,
    pub reaper_interval: Duration,
    /// Journal appends after which the compactor rewrites the journal.
    pub compact_threshold: u64,
    pub read_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let num = |key: &str, default: u64| -> u64 {
            lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        };
        Self {
            data_dir: PathBuf::from(lookup("ROOMSLOT_DATA_DIR").unwrap_or_else(|| "./data".into())),
            metrics_port: lookup("ROOMSLOT_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            hold_ttl: Duration::from_secs(num("ROOMSLOT_HOLD_TTL_SECS", 600)),
            reaper_interval: Duration::from_secs(num("ROOMSLOT_REAPER_INTERVAL_SECS", 15).max(1)),
            compact_threshold: num("ROOMSLOT_COMPACT_THRESHOLD", 1000),
            read_retries: num("ROOMSLOT_READ_RETRIES", 3).min(u32::MAX as u64) as u32,
            retry_backoff: Duration::from_millis(num("ROOMSLOT_RETRY_BACKOFF_MS", 200)),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            hold_ttl: self.hold_ttl,
            retry: RetryPolicy {
                attempts: self.read_retries,
                backoff: self.retry_backoff,
            },
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("roomslot.wal")
    }
}
