//! Batch price lookup driver
//!
//! Usage:
//!   price_batch <retailer> <gtin> [gtin ...]
//!   price_batch <retailer> --file gtins.txt
//!
//! Retailers: dm, metro (metro needs METRO_USERNAME / METRO_PASSWORD).
//! Config is read from ./pricescout.json (created with defaults on
//! first run). Results are printed to stdout as JSON; Ctrl-C stops the
//! run after the current batch and shuts the pool down cleanly.

use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tracing::{info, warn};

use pricescout::scrape::retailers;
use pricescout::{
    BatchHooks, BatchItem, BatchProcessor, BrowserPool, ConfigManager, ScrapeRunner,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        bail!("usage: price_batch <retailer> <gtin> [gtin ...] | <retailer> --file <path>");
    }

    let config = ConfigManager::new("pricescout.json").load().await?;
    pricescout::logging::init_logging_with_config(&config.logging)?;

    let retailer_name = &args[0];
    let items = collect_items(&args[1..]).await?;
    if items.is_empty() {
        bail!("no GTINs given");
    }

    let retailer = retailers::by_name(retailer_name, &config.scraper)
        .with_context(|| format!("cannot construct retailer '{retailer_name}'"))?;

    let pool = Arc::new(BrowserPool::new(config.pool.clone()));
    let runner = Arc::new(ScrapeRunner::new(
        Arc::clone(&pool),
        retailer,
        config.scraper.clone(),
    ));
    let processor = Arc::new(BatchProcessor::new(config.batch.clone()));

    // Ctrl-C: stop dispatching, let in-flight items finish, then fall
    // through to the normal shutdown below.
    {
        let processor = Arc::clone(&processor);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; stopping after the current batch");
                processor.stop();
            }
        });
    }

    let hooks = BatchHooks {
        on_progress: Some(Arc::new(|progress| {
            info!(
                "Progress: {}/{} done ({} ok, {} failed, {} cached)",
                progress.completed,
                progress.total,
                progress.successful,
                progress.failed,
                progress.cached
            );
        })),
        on_batch_complete: None,
    };

    let results = processor.process(items, runner, hooks).await?;

    let stats = pool.stats().await;
    info!(
        "Run finished: {} results, pool at {} browsers / {} pages / {}MB",
        results.len(),
        stats.browsers,
        stats.total_pages,
        stats.memory_mb
    );

    pool.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

async fn collect_items(args: &[String]) -> Result<Vec<BatchItem>> {
    if args.first().map(String::as_str) == Some("--file") {
        let path = args
            .get(1)
            .context("--file needs a path to a GTIN list (one per line)")?;
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read GTIN file {path}"))?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(BatchItem::new)
            .collect())
    } else {
        Ok(args.iter().map(BatchItem::new).collect())
    }
}
