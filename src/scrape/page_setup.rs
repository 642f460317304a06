//! Shared page preparation for retailer scrapers
//!
//! Blocks heavy resource types to cut load time and bandwidth, and
//! auto-dismisses the common cookie-consent dialogs. Retailer scrapers
//! get this behavior by default and can override it.

use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, SetBlockedUrLsParams};
use chromiumoxide::element::Element;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::error::ScrapeError;

/// URL patterns blocked on scraper pages. Product data lives in the HTML;
/// images, styles, fonts and media only slow the fetch down.
const BLOCKED_URL_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.avif", "*.svg", "*.ico",
    "*.css", "*.woff", "*.woff2", "*.ttf", "*.otf", "*.mp4", "*.webm", "*.mp3",
];

/// Consent-dialog accept buttons, tried in order. Covers Usercentrics,
/// OneTrust, Cookiebot and a handful of homegrown banners seen on German
/// retail shops.
const CONSENT_SELECTORS: &[&str] = &[
    "button[data-testid='uc-accept-all-button']",
    "#onetrust-accept-btn-handler",
    "#CybotCookiebotDialogBodyLevelButtonLevelOptinAllowAll",
    "button#accept-all-cookies",
    "button[aria-label='Alle akzeptieren']",
    "button.cookie-consent-accept",
    "[data-testid='cookie-banner-accept']",
];

/// Poll interval for selector waits. CDP has no built-in wait primitive,
/// so waits are short find_element polls under a deadline.
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Enable the network domain and block heavy resource types.
pub async fn block_heavy_resources(page: &Page) -> Result<(), ScrapeError> {
    page.execute(EnableParams::default()).await?;
    page.execute(SetBlockedUrLsParams::new(
        BLOCKED_URL_PATTERNS
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
    ))
    .await?;
    trace!("Blocked {} heavy resource patterns", BLOCKED_URL_PATTERNS.len());
    Ok(())
}

/// Try the known consent-accept selectors in order; stop at the first
/// click that lands. Returns whether a dialog was dismissed.
pub async fn dismiss_cookie_banners(page: &Page) -> bool {
    for selector in CONSENT_SELECTORS {
        let Ok(element) = page.find_element(*selector).await else {
            continue;
        };
        match element.click().await {
            Ok(_) => {
                debug!("Dismissed cookie consent via '{}'", selector);
                // Give the overlay a moment to animate out before the
                // caller starts querying the page underneath it.
                sleep(Duration::from_millis(300)).await;
                return true;
            }
            Err(e) => {
                trace!("Consent click on '{}' failed: {}", selector, e);
            }
        }
    }
    false
}

/// Wait for a selector to appear, bounded by `timeout`.
pub async fn wait_for_selector(
    page: &Page,
    selector: &str,
    timeout: Duration,
) -> Result<Element, ScrapeError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(element) = page.find_element(selector).await {
            return Ok(element);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ScrapeError::SelectorTimeout {
                selector: selector.to_string(),
                timeout,
            });
        }
        sleep(SELECTOR_POLL_INTERVAL).await;
    }
}

/// Wait until any of the given selectors appears; returns the index of
/// the first one found. Used to race a results container against a
/// "no results" marker.
pub async fn wait_for_any_selector(
    page: &Page,
    selectors: &[&str],
    timeout: Duration,
) -> Result<usize, ScrapeError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for (idx, selector) in selectors.iter().enumerate() {
            if page.find_element(*selector).await.is_ok() {
                return Ok(idx);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ScrapeError::SelectorTimeout {
                selector: selectors.join(", "),
                timeout,
            });
        }
        sleep(SELECTOR_POLL_INTERVAL).await;
    }
}
