//! METRO wholesale retailer scraper
//!
//! The METRO shop only exposes prices to logged-in business customers,
//! so every page first passes a session check and, if needed, the login
//! form. Credentials come from the environment at construction time —
//! a missing credential is a configuration error, not a scrape failure.

use async_trait::async_trait;
use chromiumoxide::Page;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{Candidate, RetailerScraper, pick_candidate};
use crate::error::ScrapeError;
use crate::scrape::{PriceResult, page_setup, price::parse_price};

const BASE_URL: &str = "https://produkte.metro.de";
const LOGIN_URL: &str = "https://www.metro.de/anmelden";

const USERNAME_ENV: &str = "METRO_USERNAME";
const PASSWORD_ENV: &str = "METRO_PASSWORD";

// Login form and session markers.
const LOGIN_USER_INPUT: &str = "input#user_id";
const LOGIN_PASSWORD_INPUT: &str = "input#password";
const LOGIN_SUBMIT: &str = "button[type='submit']";
const ACCOUNT_MARKER: &str = "[data-testid='header-account']";

// Search results DOM.
const RESULT_TILE: &str = "[data-testid='product-card']";
const NO_RESULTS: &str = "[data-testid='no-search-results']";

static TILE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(RESULT_TILE).expect("tile selector is valid"));
static TILE_LINK_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("a[data-testid='product-card-link'], a[href*='/shop/pv/']")
        .expect("tile link selector is valid")
});
static TILE_PRICE_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("[data-testid='product-price'], .product-price")
        .expect("tile price selector is valid")
});

pub struct MetroScraper {
    base_url: Url,
    username: String,
    password: String,
    result_timeout: Duration,
}

impl MetroScraper {
    /// Construct from `METRO_USERNAME` / `METRO_PASSWORD`. Fails eagerly
    /// before any pooling is involved.
    pub fn from_env(result_timeout: Duration) -> Result<Self, ScrapeError> {
        let username = std::env::var(USERNAME_ENV)
            .map_err(|_| ScrapeError::MissingCredentials(USERNAME_ENV))?;
        let password = std::env::var(PASSWORD_ENV)
            .map_err(|_| ScrapeError::MissingCredentials(PASSWORD_ENV))?;

        Ok(Self {
            base_url: Url::parse(BASE_URL).expect("metro base URL is valid"),
            username,
            password,
            result_timeout,
        })
    }

    #[cfg(test)]
    fn with_credentials(username: &str, password: &str) -> Self {
        Self {
            base_url: Url::parse(BASE_URL).expect("metro base URL is valid"),
            username: username.to_string(),
            password: password.to_string(),
            result_timeout: Duration::from_secs(5),
        }
    }

    fn search_url(&self, gtin: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_path("/shop/search");
        url.query_pairs_mut().append_pair("q", gtin);
        url
    }

    /// Pages are reused across scrapes within the pool, so an earlier
    /// login usually still holds; only a missing session marker triggers
    /// the full login form.
    async fn ensure_logged_in(&self, page: &Page) -> Result<(), ScrapeError> {
        if page.find_element(ACCOUNT_MARKER).await.is_ok() {
            return Ok(());
        }

        info!("metro: no active session on page, logging in");
        page.goto(LOGIN_URL)
            .await
            .map_err(|e| ScrapeError::Navigation(e.to_string()))?;
        let _ = page.wait_for_navigation().await;
        page_setup::dismiss_cookie_banners(page).await;

        let user_input =
            page_setup::wait_for_selector(page, LOGIN_USER_INPUT, Duration::from_secs(8))
                .await
                .map_err(|_| ScrapeError::LoginFailed("login form not found".to_string()))?;
        user_input.click().await?;
        user_input.type_str(&self.username).await?;

        let password_input = page
            .find_element(LOGIN_PASSWORD_INPUT)
            .await
            .map_err(|_| ScrapeError::LoginFailed("password field not found".to_string()))?;
        password_input.click().await?;
        password_input.type_str(&self.password).await?;

        page.find_element(LOGIN_SUBMIT)
            .await
            .map_err(|_| ScrapeError::LoginFailed("submit button not found".to_string()))?
            .click()
            .await?;

        // The account marker only renders once the session is live.
        page_setup::wait_for_selector(page, ACCOUNT_MARKER, Duration::from_secs(10))
            .await
            .map_err(|_| {
                ScrapeError::LoginFailed("credentials rejected or challenge shown".to_string())
            })?;

        info!("metro: login successful");
        Ok(())
    }

    async fn search(&self, page: &Page, gtin: &str) -> Result<PriceResult, ScrapeError> {
        self.ensure_logged_in(page).await?;

        let search_url = self.search_url(gtin);
        page.goto(search_url.as_str())
            .await
            .map_err(|e| ScrapeError::Navigation(e.to_string()))?;
        let _ = page.wait_for_navigation().await;

        match page_setup::wait_for_any_selector(
            page,
            &[RESULT_TILE, NO_RESULTS],
            self.result_timeout,
        )
        .await?
        {
            0 => {}
            _ => {
                debug!("metro: no results for GTIN {}", gtin);
                return Ok(PriceResult::default());
            }
        }

        let html = page.content().await?;
        let candidate = {
            let candidates = extract_candidates(&html, &self.base_url);
            pick_candidate(candidates, gtin)
        };

        let Some(candidate) = candidate else {
            return Ok(PriceResult::default());
        };

        let price = candidate.price_text.as_deref().and_then(parse_price);
        if price.is_none() {
            warn!("metro: tile for {} carried no parseable price", gtin);
        }

        Ok(PriceResult {
            price,
            product_url: Some(candidate.product_url),
            error: None,
        })
    }
}

#[async_trait]
impl RetailerScraper for MetroScraper {
    fn pool_key(&self) -> &str {
        "metro-scraper"
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_carries_gtin_query() {
        let scraper = MetroScraper::with_credentials("user", "pass");
        let url = scraper.search_url("4005808229741");
        assert_eq!(
            url.as_str(),
            "https://produkte.metro.de/shop/search?q=4005808229741"
        );
    }

    #[test]
    fn candidates_parse_price_text() {
        let html = r#"
            <div data-testid="product-card">
              <a data-testid="product-card-link" href="/shop/pv/123/kaffee">Kaffee</a>
              <span data-testid="product-price">13,95 €</span>
            </div>
        "#;
        let base = Url::parse(BASE_URL).unwrap();

        let candidates = extract_candidates(html, &base);
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].price_text.as_deref().and_then(parse_price),
            Some(13.95)
        );
    }
}
