//! Pipeline configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{IngestError, Result};

// ============================================================================
// Defaults
// ============================================================================

/// Default mount point under which namespaces live.
pub const DEFAULT_INPUT_ROOT: &str = "/Volumes";

/// Default SQLite database for the event table and ledger.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://quake.db";

/// Default pause between discovery cycles in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default upper bound in seconds for listing the input directory and for reading one file.
pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 60;

/// Default number of files parsed concurrently.
pub const DEFAULT_WORKERS: usize = 4;

/// Default maximum number of new files taken into one batch.
pub const DEFAULT_MAX_FILES_PER_CYCLE: usize = 1000;

/// Default number of consecutive failed cycles tolerated before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default initial retry backoff in milliseconds; doubles on each failure.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Directory below `<input_root>/<namespace>` that receives raw documents.
pub const LANDING_SUBDIR: &str = "bronze/earthquake_vol";

/// Ingestion settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    pub input_root: PathBuf,
    /// Catalog-like namespace selecting the landing directory
    pub namespace: String,
    pub database_url: String,
    pub poll_interval_secs: u64,
    pub discovery_timeout_secs: u64,
    pub workers: usize,
    pub max_files_per_cycle: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from(DEFAULT_INPUT_ROOT),
            namespace: String::new(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            discovery_timeout_secs: DEFAULT_DISCOVERY_TIMEOUT_SECS,
            workers: DEFAULT_WORKERS,
            max_files_per_cycle: DEFAULT_MAX_FILES_PER_CYCLE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    /// Load from the environment (and `.env`), falling back to defaults
    ///
    /// Not validated; apply CLI overrides first, then call [`validate`](Self::validate).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            input_root: std::env::var("QUAKE_INPUT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_INPUT_ROOT)),
            namespace: std::env::var("QUAKE_NAMESPACE").unwrap_or_default(),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            poll_interval_secs: env_parse("QUAKE_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS),
            discovery_timeout_secs: env_parse(
                "QUAKE_DISCOVERY_TIMEOUT_SECS",
                DEFAULT_DISCOVERY_TIMEOUT_SECS,
            ),
            workers: env_parse("QUAKE_WORKERS", DEFAULT_WORKERS),
            max_files_per_cycle: env_parse(
                "QUAKE_MAX_FILES_PER_CYCLE",
                DEFAULT_MAX_FILES_PER_CYCLE,
            ),
            max_retries: env_parse("QUAKE_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            retry_backoff_ms: env_parse("QUAKE_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(IngestError::config("namespace must not be empty"));
        }

        if self.namespace.contains('/') || self.namespace.contains('\\') {
            return Err(IngestError::config(format!(
                "namespace '{}' must be a single path segment",
                self.namespace
            )));
        }

        if self.database_url.is_empty() {
            return Err(IngestError::config("database URL cannot be empty"));
        }

        if self.workers == 0 {
            return Err(IngestError::config("workers must be greater than 0"));
        }

        if self.max_files_per_cycle == 0 {
            return Err(IngestError::config("max_files_per_cycle must be greater than 0"));
        }

        Ok(())
    }

    /// `<input_root>/<namespace>/bronze/earthquake_vol`
    pub fn input_path(&self) -> PathBuf {
        self.input_root.join(&self.namespace).join(LANDING_SUBDIR)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based), capped at one poll interval
    /// or one minute, whichever is larger
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.retry_backoff_ms);
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let cap = self.poll_interval().max(Duration::from_secs(60));
        base.saturating_mul(factor).min(cap)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 9] = [
        "QUAKE_INPUT_ROOT",
        "QUAKE_NAMESPACE",
        "DATABASE_URL",
        "QUAKE_POLL_INTERVAL_SECS",
        "QUAKE_DISCOVERY_TIMEOUT_SECS",
        "QUAKE_WORKERS",
        "QUAKE_MAX_FILES_PER_CYCLE",
        "QUAKE_MAX_RETRIES",
        "QUAKE_RETRY_BACKOFF_MS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    fn valid() -> IngestConfig {
        IngestConfig {
            namespace: "main".to_string(),
            ..IngestConfig::default()
        }
    }

    #[test]
    #[serial]
    fn test_from_env_reads_overrides() {
        clear_env();
        std::env::set_var("QUAKE_INPUT_ROOT", "/data/landing");
        std::env::set_var("QUAKE_NAMESPACE", "prod");
        std::env::set_var("QUAKE_WORKERS", "8");
        std::env::set_var("QUAKE_POLL_INTERVAL_SECS", "5");

        let config = IngestConfig::from_env();
        assert_eq!(config.input_root, PathBuf::from("/data/landing"));
        assert_eq!(config.namespace, "prod");
        assert_eq!(config.workers, 8);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparseable_env_values_fall_back() {
        clear_env();
        std::env::set_var("QUAKE_WORKERS", "many");

        let config = IngestConfig::from_env();
        assert_eq!(config.workers, DEFAULT_WORKERS);

        clear_env();
    }

    #[test]
    fn test_input_path() {
        let config = IngestConfig {
            input_root: PathBuf::from("/Volumes"),
            ..valid()
        };
        assert_eq!(config.input_path(), PathBuf::from("/Volumes/main/bronze/earthquake_vol"));
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());
        assert!(IngestConfig::default().validate().is_err());
        assert!(IngestConfig { namespace: "a/b".into(), ..valid() }.validate().is_err());
        assert!(IngestConfig { workers: 0, ..valid() }.validate().is_err());
        assert!(IngestConfig { max_files_per_cycle: 0, ..valid() }.validate().is_err());
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let config = IngestConfig {
            retry_backoff_ms: 100,
            poll_interval_secs: 1,
            ..valid()
        };
        assert_eq!(config.retry_backoff(1), Duration::from_millis(100));
        assert_eq!(config.retry_backoff(2), Duration::from_millis(200));
        assert_eq!(config.retry_backoff(4), Duration::from_millis(800));
        assert_eq!(config.retry_backoff(40), Duration::from_secs(60));
    }
}
