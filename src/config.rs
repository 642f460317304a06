//! Configuration for the scraping core
//!
//! Configuration is organized by subsystem: pool, scraper, batch and
//! logging. Every knob has a default tuned for polite scraping of retail
//! shops; a JSON config file can override any subset of fields.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::info;

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Browser pool settings
    pub pool: PoolConfig,

    /// Per-scraper defaults (cache, retries, timeouts)
    pub scraper: ScraperConfig,

    /// Batch processing settings
    pub batch: BatchConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Browser pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum browser processes pool-wide (enforced by LRU eviction)
    pub max_browsers: usize,

    /// Maximum pages (tabs) per browser process
    pub max_pages_per_browser: usize,

    /// How long an acquisition waits for a free page before failing
    pub acquire_timeout_secs: u64,

    /// A browser idle longer than this is closed by maintenance; idle
    /// pages are drained at half this threshold
    pub browser_idle_timeout_secs: u64,

    /// Memory ceiling for the process tree in megabytes
    pub memory_ceiling_mb: u64,

    /// Interval of the background maintenance task in seconds
    pub maintenance_interval_secs: u64,

    /// Launch browsers headless
    pub headless: bool,

    /// Fixed viewport width applied to every page
    pub window_width: u32,

    /// Fixed viewport height applied to every page
    pub window_height: u32,

    /// Fixed user agent applied to every page
    pub user_agent: String,

    /// Baseline Accept-Language header applied to every page
    pub accept_language: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_browsers: 3,
            max_pages_per_browser: 5,
            acquire_timeout_secs: 30,
            browser_idle_timeout_secs: 300,
            memory_ceiling_mb: 2048,
            maintenance_interval_secs: 60,
            headless: true,
            window_width: 1366,
            window_height: 768,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36"
                .to_string(),
            accept_language: "de-DE,de;q=0.9,en;q=0.8".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn browser_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.browser_idle_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

/// Per-scraper defaults: result cache, retry policy and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    /// Cache successful results keyed by pool key + GTIN
    pub cache_enabled: bool,

    /// Time-to-live of a cached result in seconds
    pub cache_ttl_secs: u64,

    /// Entry count past which an insert triggers an expired-entry sweep
    pub cache_high_water: usize,

    /// Attempts per scrape (pool acquisition + extraction)
    pub max_retries: u32,

    /// Base delay between attempts; grows linearly with the attempt number
    pub retry_delay_ms: u64,

    /// Upper bound for one full attempt (setup + extraction)
    pub page_timeout_secs: u64,

    /// Upper bound for the search-results container to appear
    pub result_timeout_secs: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_secs: 900,
            cache_high_water: 1000,
            max_retries: 3,
            retry_delay_ms: 2000,
            page_timeout_secs: 45,
            result_timeout_secs: 12,
        }
    }
}

impl ScraperConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }
}

/// Batch processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Number of items per batch
    pub batch_size: usize,

    /// Maximum in-flight item scrapes within a batch
    pub concurrency: usize,

    /// Delay between batches in milliseconds
    pub delay_between_batches_ms: u64,

    /// Stagger between item starts within a batch in milliseconds
    pub delay_between_items_ms: u64,

    /// Outer attempts per item, independent of the scraper's own retries
    pub max_retries: u32,

    /// Base delay between outer attempts; grows linearly
    pub retry_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 3,
            delay_between_batches_ms: 5000,
            delay_between_items_ms: 1000,
            max_retries: 2,
            retry_delay_ms: 3000,
        }
    }
}

impl BatchConfig {
    pub fn delay_between_batches(&self) -> Duration {
        Duration::from_millis(self.delay_between_batches_ms)
    }

    pub fn delay_between_items(&self) -> Duration {
        Duration::from_millis(self.delay_between_items_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted logs
    pub json_format: bool,

    /// Enable console output
    pub console_output: bool,

    /// Enable file output (daily rolling files under `file_dir`)
    pub file_output: bool,

    /// Directory for log files; defaults to ./logs next to the executable
    pub file_dir: Option<PathBuf>,

    /// Module-specific log level filters (e.g. "chromiumoxide": "warn")
    pub module_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: false,
            file_dir: None,
            module_filters: HashMap::new(),
        }
    }
}

/// Loads and persists [`AppConfig`] as a JSON file.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Load the configuration, writing defaults on first run.
    pub async fn load(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            let defaults = AppConfig::default();
            self.save(&defaults).await?;
            info!("Created default config at {}", self.config_path.display());
            return Ok(defaults);
        }

        let raw = fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("Failed to read config file {}", self.config_path.display()))?;

        let config: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", self.config_path.display()))?;

        Ok(config)
    }

    /// Persist the configuration as pretty-printed JSON.
    pub async fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.config_path, json)
            .await
            .with_context(|| format!("Failed to write config file {}", self.config_path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert!(config.pool.max_browsers >= 1);
        assert!(config.pool.max_pages_per_browser >= 1);
        assert!(config.scraper.max_retries >= 1);
        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.batch.concurrency, 3);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"batch": {"batch_size": 25}}"#).expect("parse");
        assert_eq!(config.batch.batch_size, 25);
        // untouched fields fall back to defaults
        assert_eq!(config.batch.concurrency, 3);
        assert_eq!(config.pool.max_browsers, 3);
    }

    #[tokio::test]
    async fn config_round_trips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pricescout.json");
        let manager = ConfigManager::new(&path);

        // first load writes defaults
        let loaded = manager.load().await.expect("load defaults");
        assert!(path.exists());
        assert_eq!(loaded.batch.batch_size, 10);

        let mut changed = loaded.clone();
        changed.pool.max_browsers = 7;
        manager.save(&changed).await.expect("save");

        let reloaded = manager.load().await.expect("reload");
        assert_eq!(reloaded.pool.max_browsers, 7);
    }
}
