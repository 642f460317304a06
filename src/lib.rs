//! Pricescout - pooled headless-browser price scraping core
//!
//! Looks up competitor shelf prices by GTIN across retailer web shops.
//! A bounded pool of Chromium processes is shared by all scrapers; a
//! shared runner adds caching, retries and guaranteed page release on
//! top of per-retailer extraction modules; the batch processor paces
//! large GTIN lists against rate-limiting shops.

pub mod batch;
pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod scrape;

pub use batch::{BatchHooks, BatchItem, BatchProcessor, BatchProgress, BatchResult};
pub use config::{AppConfig, BatchConfig, ConfigManager, PoolConfig, ScraperConfig};
pub use error::{BatchError, PoolError, ScrapeError};
pub use pool::{BrowserPool, PageLease, PoolStats};
pub use scrape::{GtinScraper, PriceResult, RetailerScraper, ScrapeOutcome, ScrapeRunner};
