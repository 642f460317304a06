//! Batch processor
//!
//! Runs many GTINs through one scraper in fixed-size batches. Inside a
//! batch a counting semaphore bounds the in-flight scrapes and item
//! starts are staggered; between batches the processor pauses. This
//! pacing layer is separate from the scraper's own retry policy because
//! shops block on request *rate*, and a campaign needs to tune pacing
//! without touching scraper internals.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::scrape::{GtinScraper, PriceResult};

/// One unit of work: an opaque GTIN plus optional display metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub gtin: String,
    pub name: Option<String>,
}

impl BatchItem {
    pub fn new(gtin: impl Into<String>) -> Self {
        Self {
            gtin: gtin.into(),
            name: None,
        }
    }
}

/// Exactly one per input item, appended as items complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub gtin: String,
    pub name: Option<String>,
    pub success: bool,
    pub data: Option<PriceResult>,
    pub error: Option<String>,
    pub cached: bool,
    pub duration_ms: u64,
}

/// Progress snapshot delivered after every completed batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
    pub cached: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub estimated_time_remaining_ms: Option<u64>,
}

pub type ProgressHook = Arc<dyn Fn(&BatchProgress) + Send + Sync>;

/// Caller-supplied callbacks; both optional.
#[derive(Default, Clone)]
pub struct BatchHooks {
    pub on_progress: Option<ProgressHook>,
    pub on_batch_complete: Option<ProgressHook>,
}

pub struct BatchProcessor {
    config: BatchConfig,
    running: AtomicBool,
    stop_requested: AtomicBool,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Request a cooperative stop. Checked between batches and before
    /// each item dispatch; whatever is already in flight completes and
    /// lands in the returned results.
    pub fn stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            warn!("🛑 Batch stop requested; finishing in-flight items");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Process every item, one result per input, in batch order. Never
    /// fails on individual items; the only error is a second concurrent
    /// call while a run is active.
    pub async fn process<S>(
        &self,
        items: Vec<BatchItem>,
        scraper: Arc<S>,
        hooks: BatchHooks,
    ) -> Result<Vec<BatchResult>, BatchError>
    where
        S: GtinScraper + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BatchError::AlreadyRunning);
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        let results = self.run(items, scraper, hooks).await;

        self.running.store(false, Ordering::SeqCst);
        Ok(results)
    }

    async fn run<S>(
        &self,
        items: Vec<BatchItem>,
        scraper: Arc<S>,
        hooks: BatchHooks,
    ) -> Vec<BatchResult>
    where
        S: GtinScraper + 'static,
    {
        let total = items.len();
        let batch_size = self.config.batch_size.max(1);
        let total_batches = total.div_ceil(batch_size);
        let started = Instant::now();
        let mut results: Vec<BatchResult> = Vec::with_capacity(total);

        info!(
            "🚀 Batch run via '{}': {} items in {} batches (size {}, concurrency {})",
            scraper.name(),
            total,
            total_batches,
            batch_size,
            self.config.concurrency
        );

        for (batch_index, batch) in items.chunks(batch_size).enumerate() {
            if self.stop_requested.load(Ordering::SeqCst) {
                warn!(
                    "Stop observed before batch {}/{}; {} items skipped",
                    batch_index + 1,
                    total_batches,
                    total - results.len()
                );
                break;
            }

            let batch_results = self.run_batch(batch, &scraper).await;
            results.extend(batch_results);

            let progress = self.snapshot(&results, total, batch_index + 1, total_batches, started);
            if let Some(on_batch_complete) = &hooks.on_batch_complete {
                on_batch_complete(&progress);
            }
            if let Some(on_progress) = &hooks.on_progress {
                on_progress(&progress);
            }
            info!(
                "Batch {}/{} done: {} ok, {} failed, {} cached, ~{}s left",
                progress.current_batch,
                progress.total_batches,
                progress.successful,
                progress.failed,
                progress.cached,
                progress
                    .estimated_time_remaining_ms
                    .map_or(0, |ms| ms / 1000)
            );

            let is_last = batch_index + 1 == total_batches;
            if !is_last && !self.stop_requested.load(Ordering::SeqCst) {
                sleep(self.config.delay_between_batches()).await;
            }
        }

        results
    }

    async fn run_batch<S>(&self, batch: &[BatchItem], scraper: &Arc<S>) -> Vec<BatchResult>
    where
        S: GtinScraper + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = Vec::with_capacity(batch.len());
        let mut dispatched: Vec<BatchItem> = Vec::with_capacity(batch.len());

        for (item_index, item) in batch.iter().cloned().enumerate() {
            // Stop between items: already dispatched tasks run on.
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            dispatched.push(item.clone());
            let semaphore = Arc::clone(&semaphore);
            let scraper = Arc::clone(scraper);
            let stagger = self.config.delay_between_items() * item_index as u32;
            let max_retries = self.config.max_retries;
            let retry_delay = self.config.retry_delay();

            tasks.push(tokio::spawn(async move {
                if !stagger.is_zero() {
                    sleep(stagger).await;
                }

                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return failed_result(item, "semaphore closed".to_string());
                    }
                };

                scrape_item_with_retry(scraper.as_ref(), item, max_retries, retry_delay).await
            }));
        }

        let joined = join_all(tasks).await;
        let mut batch_results = Vec::with_capacity(dispatched.len());
        for (item, task_result) in dispatched.into_iter().zip(joined) {
            match task_result {
                Ok(result) => batch_results.push(result),
                Err(e) => {
                    warn!("Item task for {} panicked: {}", item.gtin, e);
                    batch_results.push(failed_result(item, format!("task failed: {e}")));
                }
            }
        }
        batch_results
    }

    fn snapshot(
        &self,
        results: &[BatchResult],
        total: usize,
        current_batch: usize,
        total_batches: usize,
        started: Instant,
    ) -> BatchProgress {
        let completed = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        let failed = completed - successful;
        let cached = results.iter().filter(|r| r.cached).count();

        let estimated_time_remaining_ms = if completed > 0 && completed < total {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            Some(elapsed_ms / completed as u64 * (total - completed) as u64)
        } else {
            None
        };

        BatchProgress {
            total,
            completed,
            successful,
            failed,
            cached,
            current_batch,
            total_batches,
            estimated_time_remaining_ms,
        }
    }
}

/// Outer per-item retry with linear backoff, independent of whatever
/// retrying the scraper itself does internally.
async fn scrape_item_with_retry<S: GtinScraper + ?Sized>(
    scraper: &S,
    item: BatchItem,
    max_retries: u32,
    retry_delay: std::time::Duration,
) -> BatchResult {
    let started = Instant::now();
    let max_attempts = max_retries.max(1);
    let mut outcome = scraper.scrape(&item.gtin).await;

    let mut attempt = 1;
    while !outcome.is_success() && attempt < max_attempts {
        debug!(
            "Outer retry {}/{} for {} after: {}",
            attempt,
            max_attempts - 1,
            item.gtin,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
        sleep(retry_delay * attempt).await;
        outcome = scraper.scrape(&item.gtin).await;
        attempt += 1;
    }

    BatchResult {
        gtin: item.gtin,
        name: item.name,
        success: outcome.is_success(),
        data: outcome.data,
        error: outcome.error,
        cached: outcome.cached,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

fn failed_result(item: BatchItem, error: String) -> BatchResult {
    BatchResult {
        gtin: item.gtin,
        name: item.name,
        success: false,
        data: None,
        error: Some(error),
        cached: false,
        duration_ms: 0,
    }
}
