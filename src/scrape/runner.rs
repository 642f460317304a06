//! Shared scrape algorithm
//!
//! One runner wraps any [`RetailerScraper`] with the behavior every
//! retailer shares: result cache, page acquisition and guaranteed
//! release, a per-attempt timeout, and bounded retries with exponential
//! backoff. Errors never cross this boundary as `Err` — a failed scrape
//! is an outcome with the `error` field set, so batch runs continue.

use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::cache::ResultCache;
use super::retailers::RetailerScraper;
use super::{PriceResult, ScrapeOutcome};
use crate::config::ScraperConfig;
use crate::pool::BrowserPool;

/// Anything that can scrape one GTIN into an outcome. The batch
/// processor only depends on this, which keeps it testable without a
/// browser.
#[async_trait]
pub trait GtinScraper: Send + Sync {
    fn name(&self) -> &str;
    async fn scrape(&self, gtin: &str) -> ScrapeOutcome;
}

pub struct ScrapeRunner {
    pool: Arc<BrowserPool>,
    retailer: Arc<dyn RetailerScraper>,
    cache: ResultCache,
    config: ScraperConfig,
}

impl ScrapeRunner {
    pub fn new(
        pool: Arc<BrowserPool>,
        retailer: Arc<dyn RetailerScraper>,
        config: ScraperConfig,
    ) -> Self {
        let cache = ResultCache::new(config.cache_ttl(), config.cache_high_water);
        Self {
            pool,
            retailer,
            cache,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    async fn run_attempt(&self, gtin: &str, attempt: u32) -> Result<PriceResult, String> {
        let lease = self
            .pool
            .acquire(self.retailer.pool_key())
            .await
            .map_err(|e| e.to_string())?;
        let page = lease.page().clone();

        let attempt_result = timeout(self.config.page_timeout(), async {
            self.retailer
                .setup_page(&page)
                .await
                .map_err(|e| e.to_string())?;
            Ok::<PriceResult, String>(self.retailer.perform(&page, gtin).await)
        })
        .await;

        // The page goes back on every path, including timeouts.
        self.pool.release(lease).await;

        match attempt_result {
            Err(_) => Err(format!(
                "attempt {attempt} timed out after {:?}",
                self.config.page_timeout()
            )),
            Ok(Err(setup_error)) => Err(setup_error),
            Ok(Ok(result)) => match result.error {
                Some(error) => Err(error),
                None => Ok(result),
            },
        }
    }
}

#[async_trait]
impl GtinScraper for ScrapeRunner {
    fn name(&self) -> &str {
        self.retailer.pool_key()
    }

    async fn scrape(&self, gtin: &str) -> ScrapeOutcome {
        let started = Instant::now();
        let cache_key = ResultCache::cache_key(self.retailer.pool_key(), gtin);

        if self.config.cache_enabled {
            if let Some(result) = self.cache.get(&cache_key).await {
                debug!("Cache hit for {}", cache_key);
                return ScrapeOutcome {
                    data: Some(result),
                    error: None,
                    cached: true,
                    timestamp: Utc::now(),
                    duration_ms: elapsed_ms(started),
                };
            }
        }

        let attempts = run_with_retries(
            self.config.max_retries,
            self.config.retry_delay(),
            |attempt| self.run_attempt(gtin, attempt),
        )
        .await;

        match attempts {
            Ok(result) => {
                if self.config.cache_enabled {
                    self.cache.insert(cache_key, result.clone()).await;
                }
                info!(
                    "Scraped {} via {} in {}ms (price: {:?})",
                    gtin,
                    self.retailer.pool_key(),
                    elapsed_ms(started),
                    result.price
                );
                ScrapeOutcome {
                    data: Some(result),
                    error: None,
                    cached: false,
                    timestamp: Utc::now(),
                    duration_ms: elapsed_ms(started),
                }
            }
            Err(error) => {
                warn!(
                    "❌ Scrape of {} via {} failed after {} attempts: {}",
                    gtin,
                    self.retailer.pool_key(),
                    self.config.max_retries,
                    error
                );
                ScrapeOutcome {
                    data: None,
                    error: Some(error),
                    cached: false,
                    timestamp: Utc::now(),
                    duration_ms: elapsed_ms(started),
                }
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Run `attempt` up to `max_retries` times. Between failures the delay
/// grows as `retry_delay × attempt` plus a little jitter, so parallel
/// retries against the same shop do not re-align into bursts.
pub(crate) async fn run_with_retries<F, Fut>(
    max_retries: u32,
    retry_delay: Duration,
    mut attempt: F,
) -> Result<PriceResult, String>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PriceResult, String>>,
{
    let max_attempts = max_retries.max(1);
    let mut last_error = String::new();

    for attempt_number in 1..=max_attempts {
        match attempt(attempt_number).await {
            Ok(result) => {
                if attempt_number > 1 {
                    info!("Attempt {} succeeded after earlier failures", attempt_number);
                }
                return Ok(result);
            }
            Err(error) => {
                warn!("Attempt {}/{} failed: {}", attempt_number, max_attempts, error);
                last_error = error;

                if attempt_number < max_attempts {
                    let backoff = retry_delay * attempt_number
                        + Duration::from_millis(fastrand::u64(0..250));
                    sleep(backoff).await;
                }
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_bound_is_respected() {
        let calls = AtomicU32::new(0);

        let result = run_with_retries(3, Duration::from_millis(1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<PriceResult, String>("selector not found".to_string()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err(), "selector not found");
    }

    #[tokio::test]
    async fn first_success_stops_retrying() {
        let calls = AtomicU32::new(0);

        let result = run_with_retries(5, Duration::from_millis(1), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err("flaky".to_string())
                } else {
                    Ok(PriceResult {
                        price: Some(2.49),
                        product_url: None,
                        error: None,
                    })
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap().price, Some(2.49));
    }

    #[tokio::test]
    async fn backoff_is_non_decreasing() {
        // Record the gaps between attempts and check they grow.
        let timestamps = std::sync::Mutex::new(Vec::<Instant>::new());

        // Base delay well above the jitter window so ordering is stable.
        let _ = run_with_retries(3, Duration::from_millis(300), |_| {
            timestamps.lock().unwrap().push(Instant::now());
            async { Err::<PriceResult, String>("always fails".to_string()) }
        })
        .await;

        let stamps = timestamps.into_inner().unwrap();
        assert_eq!(stamps.len(), 3);
        let first_gap = stamps[1] - stamps[0];
        let second_gap = stamps[2] - stamps[1];
        assert!(
            second_gap >= first_gap,
            "backoff must not shrink: {first_gap:?} then {second_gap:?}"
        );
    }

    #[tokio::test]
    async fn zero_retries_still_runs_once() {
        let calls = AtomicU32::new(0);
        let _ = run_with_retries(0, Duration::from_millis(1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<PriceResult, String>("nope".to_string()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
