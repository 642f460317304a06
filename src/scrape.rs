//! Scraping layer: shared runner, result cache, page preparation and
//! the per-retailer scraper implementations.

pub mod cache;
pub mod page_setup;
pub mod price;
pub mod retailers;
pub mod runner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use retailers::RetailerScraper;
pub use runner::{GtinScraper, ScrapeRunner};

/// What a retailer scraper hands back for one GTIN. At most one of
/// `price`/`product_url` vs `error` is meaningful: a set `error` marks
/// a failed attempt, everything else is a success — including the
/// empty result for "product not carried by this shop".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceResult {
    pub price: Option<f64>,
    pub product_url: Option<String>,
    pub error: Option<String>,
}

impl PriceResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            price: None,
            product_url: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A scrape result with the runner's metadata attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    /// Extraction result; `None` when all attempts failed
    pub data: Option<PriceResult>,

    /// Last attempt's error when all attempts failed
    pub error: Option<String>,

    /// Served from the TTL cache without touching the pool
    pub cached: bool,

    /// Wall-clock completion time
    pub timestamp: DateTime<Utc>,

    /// Total elapsed time including retries and backoff
    pub duration_ms: u64,
}

impl ScrapeOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
