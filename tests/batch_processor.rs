//! Batch processor behavior against a deterministic fake scraper.
//!
//! No browser involved: the processor only depends on the `GtinScraper`
//! capability, so completeness, concurrency bounds, pacing and stop
//! semantics are all checked without network or Chromium.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

use pricescout::scrape::{GtinScraper, PriceResult, ScrapeOutcome};
use pricescout::{BatchConfig, BatchError, BatchHooks, BatchItem, BatchProcessor};

struct FakeScraper {
    delay: Duration,
    fail_gtins: HashSet<String>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeScraper {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail_gtins: HashSet::new(),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn failing_on(mut self, gtins: &[&str]) -> Self {
        self.fail_gtins = gtins.iter().map(ToString::to_string).collect();
        self
    }
}

#[async_trait]
impl GtinScraper for FakeScraper {
    fn name(&self) -> &str {
        "fake-scraper"
    }

    async fn scrape(&self, gtin: &str) -> ScrapeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_gtins.contains(gtin) {
            ScrapeOutcome {
                data: None,
                error: Some("selector not found".to_string()),
                cached: false,
                timestamp: Utc::now(),
                duration_ms: self.delay.as_millis() as u64,
            }
        } else {
            ScrapeOutcome {
                data: Some(PriceResult {
                    price: Some(9.99),
                    product_url: Some(format!("https://shop.test/p/{gtin}")),
                    error: None,
                }),
                error: None,
                cached: false,
                timestamp: Utc::now(),
                duration_ms: self.delay.as_millis() as u64,
            }
        }
    }
}

fn fast_config() -> BatchConfig {
    BatchConfig {
        batch_size: 10,
        concurrency: 3,
        delay_between_batches_ms: 0,
        delay_between_items_ms: 0,
        max_retries: 1,
        retry_delay_ms: 0,
    }
}

fn items(n: usize) -> Vec<BatchItem> {
    (0..n).map(|i| BatchItem::new(format!("400580822{i:04}"))).collect()
}

#[tokio::test]
async fn twenty_five_items_run_in_three_batches() {
    let processor = BatchProcessor::new(fast_config());
    let scraper = Arc::new(FakeScraper::new(Duration::from_millis(5)));
    let batch_completions = Arc::new(AtomicUsize::new(0));

    let hooks = BatchHooks {
        on_progress: None,
        on_batch_complete: Some({
            let batch_completions = Arc::clone(&batch_completions);
            Arc::new(move |progress| {
                batch_completions.fetch_add(1, Ordering::SeqCst);
                assert_eq!(progress.total_batches, 3);
                assert_eq!(progress.total, 25);
            })
        }),
    };

    let results = processor
        .process(items(25), scraper, hooks)
        .await
        .expect("batch run");

    assert_eq!(results.len(), 25);
    assert_eq!(batch_completions.load(Ordering::SeqCst), 3);

    let successful = results.iter().filter(|r| r.success).count();
    let failed = results.iter().filter(|r| !r.success).count();
    assert_eq!(successful + failed, 25);
}

#[tokio::test]
async fn every_input_gtin_appears_exactly_once() {
    let processor = BatchProcessor::new(fast_config());
    let scraper = Arc::new(FakeScraper::new(Duration::from_millis(1)));
    let input = items(23);
    let expected: HashSet<String> = input.iter().map(|i| i.gtin.clone()).collect();

    let results = processor
        .process(input, scraper, BatchHooks::default())
        .await
        .expect("batch run");

    let got: HashSet<String> = results.iter().map(|r| r.gtin.clone()).collect();
    assert_eq!(results.len(), 23, "no duplicates, no omissions");
    assert_eq!(got, expected);
}

#[tokio::test]
async fn in_flight_scrapes_never_exceed_concurrency() {
    let mut config = fast_config();
    config.concurrency = 3;
    config.batch_size = 12;
    let processor = BatchProcessor::new(config);
    let scraper = Arc::new(FakeScraper::new(Duration::from_millis(25)));

    processor
        .process(items(24), Arc::clone(&scraper), BatchHooks::default())
        .await
        .expect("batch run");

    assert!(
        scraper.max_in_flight.load(Ordering::SeqCst) <= 3,
        "saw {} concurrent scrapes",
        scraper.max_in_flight.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn failures_become_results_not_errors() {
    let processor = BatchProcessor::new(fast_config());
    let scraper = Arc::new(
        FakeScraper::new(Duration::from_millis(1)).failing_on(&["4005808220001", "4005808220003"]),
    );

    let results = processor
        .process(items(6), scraper, BatchHooks::default())
        .await
        .expect("batch run must not fail on item errors");

    assert_eq!(results.len(), 6);
    let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
    assert_eq!(failed.len(), 2);
    for result in failed {
        assert_eq!(result.error.as_deref(), Some("selector not found"));
        assert!(result.data.is_none());
    }
}

#[tokio::test]
async fn outer_retries_are_bounded() {
    let mut config = fast_config();
    config.max_retries = 3;
    config.batch_size = 1;
    let processor = BatchProcessor::new(config);
    let scraper =
        Arc::new(FakeScraper::new(Duration::from_millis(1)).failing_on(&["4005808220000"]));

    let results = processor
        .process(items(1), Arc::clone(&scraper), BatchHooks::default())
        .await
        .expect("batch run");

    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert_eq!(
        scraper.calls.load(Ordering::SeqCst),
        3,
        "exactly max_retries attempts for a permanently failing item"
    );
}

#[tokio::test]
async fn stop_after_first_batch_skips_the_rest() {
    let processor = Arc::new(BatchProcessor::new(fast_config()));
    let scraper = Arc::new(FakeScraper::new(Duration::from_millis(5)));

    let hooks = BatchHooks {
        on_progress: None,
        on_batch_complete: Some({
            let processor = Arc::clone(&processor);
            Arc::new(move |_progress| {
                processor.stop();
            })
        }),
    };

    let results = processor
        .process(items(25), scraper, hooks)
        .await
        .expect("batch run");

    assert_eq!(
        results.len(),
        10,
        "items of the first batch complete, later batches never start"
    );
}

#[tokio::test]
async fn second_concurrent_run_fails_fast() {
    let processor = Arc::new(BatchProcessor::new(fast_config()));
    let slow_scraper = Arc::new(FakeScraper::new(Duration::from_millis(200)));

    let first = {
        let processor = Arc::clone(&processor);
        let scraper = Arc::clone(&slow_scraper);
        tokio::spawn(async move { processor.process(items(3), scraper, BatchHooks::default()).await })
    };

    // Give the first run time to take the single-flight slot.
    sleep(Duration::from_millis(50)).await;

    let second = processor
        .process(items(3), Arc::new(FakeScraper::new(Duration::ZERO)), BatchHooks::default())
        .await;
    assert!(matches!(second, Err(BatchError::AlreadyRunning)));

    let first = first.await.expect("join").expect("first run");
    assert_eq!(first.len(), 3);

    // The slot frees up once the first run finishes.
    let third = processor
        .process(items(1), Arc::new(FakeScraper::new(Duration::ZERO)), BatchHooks::default())
        .await;
    assert!(third.is_ok());
}

#[tokio::test]
async fn progress_totals_are_consistent() {
    let mut config = fast_config();
    config.batch_size = 4;
    let processor = BatchProcessor::new(config);
    let scraper = Arc::new(FakeScraper::new(Duration::from_millis(1)).failing_on(&["4005808220002"]));
    let snapshots = Arc::new(std::sync::Mutex::new(Vec::new()));

    let hooks = BatchHooks {
        on_progress: Some({
            let snapshots = Arc::clone(&snapshots);
            Arc::new(move |progress| {
                snapshots.lock().unwrap().push(progress.clone());
            })
        }),
        on_batch_complete: None,
    };

    processor
        .process(items(10), scraper, hooks)
        .await
        .expect("batch run");

    let snapshots = snapshots.lock().unwrap();
    assert_eq!(snapshots.len(), 3, "one snapshot per batch (4+4+2)");

    let last = snapshots.last().unwrap();
    assert_eq!(last.completed, 10);
    assert_eq!(last.successful + last.failed, 10);
    assert_eq!(last.failed, 1);
    assert_eq!(last.current_batch, 3);
    assert!(last.estimated_time_remaining_ms.is_none(), "nothing left at the end");

    // Completed counts grow monotonically batch over batch.
    assert!(snapshots.windows(2).all(|w| w[0].completed < w[1].completed));
}
