//! dm.de retailer scraper
//!
//! Anonymous GTIN search against the dm-drogerie markt web shop. Price
//! is taken from the search-result tile when present, with a fallback
//! navigation into the product page.

use async_trait::async_trait;
use chromiumoxide::Page;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{Candidate, RetailerScraper, pick_candidate};
use crate::error::ScrapeError;
use crate::scrape::{PriceResult, page_setup, price::parse_price};

const BASE_URL: &str = "https://www.dm.de";

// Search results DOM. dm renders product tiles with data-dmid markers;
// these rot with shop redesigns and live only here.
const RESULT_TILE: &str = "[data-dmid='product-tile']";
const NO_RESULTS: &str = "[data-dmid='empty-search-results']";
const PRODUCT_PAGE_PRICE: &str = "[data-dmid='price-localized']";

static TILE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(RESULT_TILE).expect("tile selector is valid"));
static TILE_LINK_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("a[data-dmid='product-tile-link'], a[href*='/p']")
        .expect("tile link selector is valid")
});
static TILE_PRICE_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("[data-dmid='price-localized'], .product-price")
        .expect("tile price selector is valid")
});

pub struct DmScraper {
    base_url: Url,
    result_timeout: Duration,
}

impl DmScraper {
    pub fn new(result_timeout: Duration) -> Self {
        Self {
            base_url: Url::parse(BASE_URL).expect("dm base URL is valid"),
            result_timeout,
        }
    }

    fn search_url(&self, gtin: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_path("/search");
        url.query_pairs_mut().append_pair("query", gtin);
        url
    }

    async fn search(&self, page: &Page, gtin: &str) -> Result<PriceResult, ScrapeError> {
        let search_url = self.search_url(gtin);
        page.goto(search_url.as_str())
            .await
            .map_err(|e| ScrapeError::Navigation(e.to_string()))?;
        let _ = page.wait_for_navigation().await;

        page_setup::dismiss_cookie_banners(page).await;

        // Race the results grid against the explicit empty state. "No
        // results" is a successful lookup with empty fields.
        match page_setup::wait_for_any_selector(
            page,
            &[RESULT_TILE, NO_RESULTS],
            self.result_timeout,
        )
        .await?
        {
            0 => {}
            _ => {
                debug!("dm: no results for GTIN {}", gtin);
                return Ok(PriceResult::default());
            }
        }

        let html = page.content().await?;
        let candidate = {
            let candidates = extract_candidates(&html, &self.base_url);
            pick_candidate(candidates, gtin)
        };

        let Some(candidate) = candidate else {
            // Results container appeared but no tile parsed out of it;
            // most likely a markup change worth retrying elsewhere.
            return Ok(PriceResult::default());
        };

        let mut result = PriceResult {
            price: candidate.price_text.as_deref().and_then(parse_price),
            product_url: Some(candidate.product_url.clone()),
            error: None,
        };

        // Tile had no (parseable) price: follow the product link.
        if result.price.is_none() {
            match self.price_from_product_page(page, &candidate.product_url).await {
                Ok(price) => result.price = price,
                Err(e) => {
                    warn!("dm: product page fallback failed for {}: {}", gtin, e);
                }
            }
        }

        Ok(result)
    }

    async fn price_from_product_page(
        &self,
        page: &Page,
        product_url: &str,
    ) -> Result<Option<f64>, ScrapeError> {
        page.goto(product_url)
            .await
            .map_err(|e| ScrapeError::Navigation(e.to_string()))?;
        let _ = page.wait_for_navigation().await;

        let element =
            page_setup::wait_for_selector(page, PRODUCT_PAGE_PRICE, self.result_timeout).await?;
        let text = element.inner_text().await?.unwrap_or_default();
        Ok(parse_price(&text))
    }
}

#[async_trait]
impl RetailerScraper for DmScraper {
    fn pool_key(&self) -> &str {
        "dm-scraper"
    }

    async fn perform(&self, page: &Page, gtin: &str) -> PriceResult {
        match self.search(page, gtin).await {
            Ok(result) => result,
            Err(e) => PriceResult::failed(e.to_string()),
        }
    }
}

fn extract_candidates(html: &str, base_url: &Url) -> Vec<Candidate> {
    let doc = Html::parse_document(html);
    let mut candidates = Vec::new();

    for tile in doc.select(&TILE_SELECTOR) {
        let Some(link) = tile.select(&TILE_LINK_SELECTOR).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Ok(product_url) = base_url.join(href) else {
            continue;
        };

        let price_text = tile
            .select(&TILE_PRICE_SELECTOR)
            .next()
            .map(|el| el.text().collect::<String>());

        candidates.push(Candidate {
            product_url: product_url.to_string(),
            price_text,
            markup: tile.html(),
        });
    }

    candidates
}
