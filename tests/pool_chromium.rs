//! Pool scenarios against a real Chromium.
//!
//! Ignored by default: these launch actual browser processes and need a
//! Chromium/Chrome binary on PATH. Run with
//! `cargo test --test pool_chromium -- --ignored`.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use pricescout::{BrowserPool, PoolConfig, PoolError};

fn tiny_pool_config() -> PoolConfig {
    PoolConfig {
        max_browsers: 1,
        max_pages_per_browser: 2,
        acquire_timeout_secs: 15,
        ..PoolConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a local Chromium binary"]
async fn third_acquire_waits_for_a_release() {
    let pool = Arc::new(BrowserPool::new(tiny_pool_config()));

    let first = pool.acquire("x").await.expect("first page");
    let second = pool.acquire("x").await.expect("second page");
    assert_ne!(first.page_id(), second.page_id(), "pages are distinct");

    // Cap is 2: a third acquisition must block.
    let blocked = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire("x").await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!blocked.is_finished(), "third acquire must wait at the cap");

    // Releasing one page hands the slot to the waiter.
    let released_id = first.page_id();
    pool.release(first).await;
    let third = timeout(Duration::from_secs(5), blocked)
        .await
        .expect("waiter resolves after release")
        .expect("join")
        .expect("third page");
    assert_eq!(third.page_id(), released_id, "freed page goes to the oldest waiter");

    pool.release(second).await;
    pool.release(third).await;
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a local Chromium binary"]
async fn page_cap_per_browser_is_never_exceeded() {
    let pool = Arc::new(BrowserPool::new(tiny_pool_config()));

    let a = pool.acquire("x").await.expect("page a");
    let b = pool.acquire("x").await.expect("page b");

    let stats = pool.stats().await;
    assert_eq!(stats.browsers, 1);
    assert_eq!(stats.total_pages, 2);
    assert_eq!(stats.active_keys, vec!["x".to_string()]);

    pool.release(a).await;
    pool.release(b).await;

    // Released pages are reused, not re-created.
    let c = pool.acquire("x").await.expect("page c");
    let stats = pool.stats().await;
    assert_eq!(stats.total_pages, 2);

    pool.release(c).await;
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a local Chromium binary"]
async fn exhaustion_times_out_with_retryable_error() {
    let config = PoolConfig {
        max_browsers: 1,
        max_pages_per_browser: 1,
        acquire_timeout_secs: 2,
        ..PoolConfig::default()
    };
    let pool = BrowserPool::new(config);

    let held = pool.acquire("x").await.expect("page");
    let denied = pool.acquire("x").await;
    assert!(matches!(denied, Err(PoolError::Exhausted(_))));

    pool.release(held).await;
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a local Chromium binary"]
async fn acquire_after_shutdown_fails_fast() {
    let pool = BrowserPool::new(tiny_pool_config());

    let lease = pool.acquire("x").await.expect("page");
    pool.release(lease).await;
    pool.shutdown().await;

    let denied = pool.acquire("x").await;
    assert!(matches!(denied, Err(PoolError::ShuttingDown)));
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a local Chromium binary"]
async fn pool_keys_get_independent_browsers() {
    let config = PoolConfig {
        max_browsers: 2,
        max_pages_per_browser: 1,
        ..PoolConfig::default()
    };
    let pool = BrowserPool::new(config);

    let dm = pool.acquire("dm-scraper").await.expect("dm page");
    let metro = pool.acquire("metro-scraper").await.expect("metro page");

    let stats = pool.stats().await;
    assert_eq!(stats.browsers, 2);

    pool.release(dm).await;
    pool.release(metro).await;
    pool.shutdown().await;
}
