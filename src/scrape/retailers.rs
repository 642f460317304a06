//! Retailer scraper capability
//!
//! A retailer module supplies only the site-specific navigation and
//! extraction steps; pooling, caching and retries live in the shared
//! runner. Selector strings are per-retailer constants and are expected
//! to rot as the shops redesign — the selection *policy* (organic
//! results first, GTIN match second, first tile last) is the stable part.

pub mod dm;
pub mod metro;

use async_trait::async_trait;
use chromiumoxide::Page;
use std::sync::Arc;

use super::{PriceResult, page_setup};
use crate::config::ScraperConfig;
use crate::error::ScrapeError;

/// Site-specific half of a scraper: everything the shared runner cannot
/// know about a retailer. `perform` must never panic and never return an
/// `Err` — failures go into [`PriceResult::error`] so the runner's retry
/// and cache logic works the same across retailers.
#[async_trait]
pub trait RetailerScraper: Send + Sync {
    /// Logical identity partitioning the browser pool, e.g. "dm-scraper".
    fn pool_key(&self) -> &str;

    /// One-time preparation of a freshly acquired page. The default blocks
    /// heavy resource types; retailers needing images can override.
    async fn setup_page(&self, page: &Page) -> Result<(), ScrapeError> {
        page_setup::block_heavy_resources(page).await
    }

    /// Run the retailer-specific search and extraction for one GTIN.
    async fn perform(&self, page: &Page, gtin: &str) -> PriceResult;
}

/// Look up a retailer scraper by its CLI/config name.
pub fn by_name(
    name: &str,
    config: &ScraperConfig,
) -> Result<Arc<dyn RetailerScraper>, ScrapeError> {
    match name {
        "dm" => Ok(Arc::new(dm::DmScraper::new(config.result_timeout()))),
        "metro" => Ok(Arc::new(metro::MetroScraper::from_env(
            config.result_timeout(),
        )?)),
        other => Err(ScrapeError::Automation(format!(
            "unknown retailer '{other}' (known: dm, metro)"
        ))),
    }
}

/// One search-result tile as extracted from the results DOM.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub product_url: String,
    pub price_text: Option<String>,
    /// Raw tile markup, used for the GTIN-substring fallback and the
    /// sponsorship container hints.
    pub markup: String,
}

// URL substrings marking paid placements across the supported shops.
const SPONSORED_URL_HINTS: &[&str] = &[
    "sponsored", "werbung", "anzeige", "ad_id=", "adserver", "utm_source=ads", "promo_id=",
];

// Class/attribute fragments that mark a tile container as an ad slot.
const SPONSORED_MARKUP_HINTS: &[&str] = &[
    "sponsored", "ad-tile", "-ad-", "anzeige", "promoted", "sas_", "adslot",
];

pub(crate) fn looks_sponsored(candidate: &Candidate) -> bool {
    let url = candidate.product_url.to_lowercase();
    if SPONSORED_URL_HINTS.iter().any(|hint| url.contains(hint)) {
        return true;
    }
    let markup = candidate.markup.to_lowercase();
    SPONSORED_MARKUP_HINTS.iter().any(|hint| markup.contains(hint))
}

/// Select the tile to trust for price and product URL:
/// organic tile whose markup carries the GTIN, else the first organic
/// tile, else the first tile of any kind.
pub(crate) fn pick_candidate(candidates: Vec<Candidate>, gtin: &str) -> Option<Candidate> {
    if candidates.is_empty() {
        return None;
    }

    let mut first_organic: Option<usize> = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        if looks_sponsored(candidate) {
            continue;
        }
        if candidate.markup.contains(gtin) || candidate.product_url.contains(gtin) {
            return candidates.into_iter().nth(idx);
        }
        if first_organic.is_none() {
            first_organic = Some(idx);
        }
    }

    let idx = first_organic.unwrap_or(0);
    candidates.into_iter().nth(idx)
}
