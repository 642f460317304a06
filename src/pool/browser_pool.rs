//! Browser pool
//!
//! Owns every Chromium process and page in the system, partitioned by
//! pool key (one browser lineage per scraper identity). Pages are the
//! unit of exclusive allocation: `acquire` hands out a [`PageLease`],
//! `release` resets the page and returns it to the idle set or hands it
//! straight to the oldest waiter. Browsers launch lazily on first demand
//! for a key and are reclaimed by the background maintenance task when
//! idle or under memory pressure.

use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    Headers, SetBlockedUrLsParams, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::maintenance;
use crate::config::PoolConfig;
use crate::error::PoolError;

/// Chromium flags applied to every launched browser. Fixed on purpose:
/// a stable fingerprint across scrapes draws less attention than a
/// shifting one.
const BROWSER_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-background-networking",
];

pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) shutdown: tokio_util::sync::CancellationToken,
}

#[derive(Default)]
pub(crate) struct PoolState {
    pub(crate) browsers: HashMap<String, ManagedBrowser>,
    pub(crate) waiters: HashMap<String, VecDeque<Waiter>>,
    pub(crate) shut_down: bool,
}

pub(crate) struct ManagedBrowser {
    pub(crate) browser: Browser,
    pub(crate) handler_task: JoinHandle<()>,
    #[allow(dead_code)]
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
    pub(crate) use_count: u64,
    /// Insertion order is creation order.
    pub(crate) pages: Vec<ManagedPage>,
}

pub(crate) struct ManagedPage {
    pub(crate) id: Uuid,
    pub(crate) page: Page,
    pub(crate) in_use: bool,
    pub(crate) last_used: Instant,
    pub(crate) use_count: u64,
}

pub(crate) struct Waiter {
    pub(crate) id: Uuid,
    pub(crate) tx: oneshot::Sender<PageLease>,
}

/// Exclusive hold on one pooled page. Give it back with
/// [`BrowserPool::release`]; a lease dropped without release is logged
/// as a caller bug and reclaimed by a background task.
pub struct PageLease {
    pool_key: String,
    page_id: Uuid,
    page: Page,
    inner: Arc<PoolInner>,
    runtime: tokio::runtime::Handle,
    released: bool,
}

impl PageLease {
    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn pool_key(&self) -> &str {
        &self.pool_key
    }

    pub fn page_id(&self) -> Uuid {
        self.page_id
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            "PageLease for '{}' dropped without release; reclaiming in background",
            self.pool_key
        );
        let inner = Arc::clone(&self.inner);
        let pool_key = self.pool_key.clone();
        let page_id = self.page_id;
        self.runtime.spawn(async move {
            inner.release_page(&pool_key, page_id).await;
        });
    }
}

/// Observability snapshot; not part of any correctness contract.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub browsers: usize,
    pub total_pages: usize,
    pub active_keys: Vec<String>,
    pub memory_mb: u64,
}

enum Acquisition {
    Ready(PageLease),
    Queued {
        waiter_id: Uuid,
        rx: oneshot::Receiver<PageLease>,
    },
}

impl BrowserPool {
    /// Create a pool and start its maintenance task. Must be called from
    /// within a Tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            config,
            state: Mutex::new(PoolState::default()),
            shutdown: tokio_util::sync::CancellationToken::new(),
        });
        maintenance::spawn_maintenance(Arc::clone(&inner));
        Self { inner }
    }

    /// Acquire an exclusive page for `pool_key`, launching the key's
    /// browser on first use. Blocks in a FIFO queue when the browser is
    /// at its page cap, bounded by the configured acquisition timeout.
    pub async fn acquire(&self, pool_key: &str) -> Result<PageLease, PoolError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let (waiter_id, rx) = match self.inner.acquire_or_enqueue(pool_key).await? {
            Acquisition::Ready(lease) => return Ok(lease),
            Acquisition::Queued { waiter_id, rx } => (waiter_id, rx),
        };

        match timeout(self.inner.config.acquire_timeout(), rx).await {
            Ok(Ok(lease)) => Ok(lease),
            // Sender side only disappears when the pool tears down.
            Ok(Err(_)) => Err(PoolError::ShuttingDown),
            Err(_) => {
                self.inner.remove_waiter(pool_key, waiter_id).await;
                Err(PoolError::Exhausted(self.inner.config.acquire_timeout()))
            }
        }
    }

    /// Return a page to the pool. The page is reset (blank navigation,
    /// URL blocks lifted) and either parked idle or handed to the oldest
    /// waiter; a page that fails its reset is force-closed and removed.
    pub async fn release(&self, mut lease: PageLease) {
        lease.released = true;
        let pool_key = lease.pool_key.clone();
        let page_id = lease.page_id;
        drop(lease);
        self.inner.release_page(&pool_key, page_id).await;
    }

    pub async fn stats(&self) -> PoolStats {
        let (browsers, total_pages, active_keys) = {
            let state = self.inner.state.lock().await;
            (
                state.browsers.len(),
                state.browsers.values().map(|b| b.pages.len()).sum(),
                state.browsers.keys().cloned().collect(),
            )
        };

        PoolStats {
            browsers,
            total_pages,
            active_keys,
            memory_mb: maintenance::sample_process_tree_mb().await,
        }
    }

    /// Close every page and browser. Queued waiters fail fast; later
    /// acquisitions return [`PoolError::ShuttingDown`].
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let browsers = {
            let mut state = self.inner.state.lock().await;
            state.shut_down = true;
            // Dropping the senders wakes every queued acquire with an error.
            state.waiters.clear();
            std::mem::take(&mut state.browsers)
        };

        info!("🛑 Shutting down browser pool ({} browsers)", browsers.len());
        for (pool_key, managed) in browsers {
            debug!("Closing browser for pool key '{}'", pool_key);
            close_browser(managed).await;
        }
    }
}

impl PoolInner {
    async fn acquire_or_enqueue(self: &Arc<Self>, pool_key: &str) -> Result<Acquisition, PoolError> {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return Err(PoolError::ShuttingDown);
        }

        if !state.browsers.contains_key(pool_key) {
            self.evict_lru_if_at_capacity(&mut state);
            let managed = launch_browser(&self.config, pool_key).await?;
            state.browsers.insert(pool_key.to_string(), managed);
            info!("🚀 Launched browser for pool key '{}'", pool_key);
        }

        // Prefer an idle page; a page that no longer answers is purged
        // and the next idle one tried.
        loop {
            let Some(browser) = state.browsers.get_mut(pool_key) else {
                break;
            };
            let Some(pos) = browser.pages.iter().position(|p| !p.in_use) else {
                break;
            };
            let probe = browser.pages[pos].page.clone();
            if probe.url().await.is_ok() {
                let now = Instant::now();
                let page = {
                    let managed_page = &mut browser.pages[pos];
                    managed_page.in_use = true;
                    managed_page.last_used = now;
                    managed_page.use_count += 1;
                    managed_page.page.clone()
                };
                let page_id = browser.pages[pos].id;
                browser.last_used = now;
                browser.use_count += 1;
                return Ok(Acquisition::Ready(self.make_lease(pool_key, page_id, page)));
            }

            warn!("Purging dead page from pool key '{}'", pool_key);
            let dead = browser.pages.remove(pos);
            spawn_close_page(dead.page);
        }

        let browser = state
            .browsers
            .get_mut(pool_key)
            .ok_or(PoolError::ShuttingDown)?;

        if browser.pages.len() < self.config.max_pages_per_browser {
            let mut managed_page = create_page(&self.config, pool_key, &browser.browser).await?;
            let now = Instant::now();
            managed_page.in_use = true;
            managed_page.last_used = now;
            managed_page.use_count = 1;
            let page_id = managed_page.id;
            let page = managed_page.page.clone();
            browser.pages.push(managed_page);
            browser.last_used = now;
            browser.use_count += 1;
            debug!(
                "Created page {}/{} for pool key '{}'",
                browser.pages.len(),
                self.config.max_pages_per_browser,
                pool_key
            );
            return Ok(Acquisition::Ready(self.make_lease(pool_key, page_id, page)));
        }

        // Page cap reached: queue up, oldest waiter first.
        let (tx, rx) = oneshot::channel();
        let waiter_id = Uuid::new_v4();
        state
            .waiters
            .entry(pool_key.to_string())
            .or_default()
            .push_back(Waiter { id: waiter_id, tx });
        debug!("Queued waiter for pool key '{}'", pool_key);
        Ok(Acquisition::Queued { waiter_id, rx })
    }

    pub(crate) async fn release_page(self: &Arc<Self>, pool_key: &str, page_id: Uuid) {
        let page = {
            let state = self.state.lock().await;
            let Some(browser) = state.browsers.get(pool_key) else {
                return;
            };
            let Some(managed_page) = browser.pages.iter().find(|p| p.id == page_id) else {
                return;
            };
            managed_page.page.clone()
        };

        // Reset outside the lock; the page is still marked in-use so no
        // one else can grab it meanwhile.
        let reset_ok = reset_page(&page).await;

        let mut state = self.state.lock().await;
        if state.shut_down {
            return;
        }
        let Some(browser) = state.browsers.get_mut(pool_key) else {
            return;
        };
        let now = Instant::now();
        browser.last_used = now;
        let Some(pos) = browser.pages.iter().position(|p| p.id == page_id) else {
            return;
        };

        if reset_ok {
            let managed_page = &mut browser.pages[pos];
            managed_page.in_use = false;
            managed_page.last_used = now;
        } else {
            warn!(
                "Page reset failed; force-closing and removing it (pool key '{}')",
                pool_key
            );
            let dead = browser.pages.remove(pos);
            spawn_close_page(dead.page);
        }

        self.fulfil_waiters(&mut state, pool_key).await;
    }

    /// Hand free capacity to queued waiters, oldest first: reuse the just
    /// freed idle page, or create a replacement when a removal left room
    /// under the cap.
    async fn fulfil_waiters(self: &Arc<Self>, state: &mut PoolState, pool_key: &str) {
        loop {
            let queue_empty = state
                .waiters
                .get(pool_key)
                .is_none_or(|queue| queue.is_empty());
            if queue_empty {
                state.waiters.remove(pool_key);
                return;
            }

            let allocation = {
                let Some(browser) = state.browsers.get_mut(pool_key) else {
                    // Browser evicted while waiters queued; they re-enter
                    // via timeout or the next acquire relaunches lazily.
                    return;
                };
                let now = Instant::now();

                if let Some(pos) = browser.pages.iter().position(|p| !p.in_use) {
                    let managed_page = &mut browser.pages[pos];
                    managed_page.in_use = true;
                    managed_page.last_used = now;
                    managed_page.use_count += 1;
                    browser.last_used = now;
                    browser.use_count += 1;
                    Some((managed_page.id, managed_page.page.clone()))
                } else if browser.pages.len() < self.config.max_pages_per_browser {
                    match create_page(&self.config, pool_key, &browser.browser).await {
                        Ok(mut managed_page) => {
                            managed_page.in_use = true;
                            managed_page.use_count = 1;
                            let id = managed_page.id;
                            let page = managed_page.page.clone();
                            browser.pages.push(managed_page);
                            browser.last_used = now;
                            browser.use_count += 1;
                            Some((id, page))
                        }
                        Err(e) => {
                            warn!("Replacement page for waiter failed: {}", e);
                            None
                        }
                    }
                } else {
                    None
                }
            };

            let Some((page_id, page)) = allocation else {
                return;
            };

            let Some(waiter) = state
                .waiters
                .get_mut(pool_key)
                .and_then(VecDeque::pop_front)
            else {
                // Last waiter timed out between the check and the pop.
                mark_idle(state, pool_key, page_id);
                return;
            };

            let lease = self.make_lease(pool_key, page_id, page);
            if let Err(mut unclaimed) = waiter.tx.send(lease) {
                // Receiver timed out already; undo and try the next one.
                unclaimed.released = true;
                drop(unclaimed);
                mark_idle(state, pool_key, page_id);
                continue;
            }
            debug!("Handed freed page to waiter (pool key '{}')", pool_key);
        }
    }

    async fn remove_waiter(&self, pool_key: &str, waiter_id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(queue) = state.waiters.get_mut(pool_key) {
            queue.retain(|w| w.id != waiter_id);
            if queue.is_empty() {
                state.waiters.remove(pool_key);
            }
        }
    }

    /// Enforce the pool-wide browser cap by evicting the LRU lineage.
    /// New keys are always admitted; old lineages pay for them.
    fn evict_lru_if_at_capacity(&self, state: &mut PoolState) {
        while state.browsers.len() >= self.config.max_browsers {
            let lru_key = state
                .browsers
                .iter()
                .min_by_key(|(_, b)| b.last_used)
                .map(|(k, _)| k.clone());
            let Some(key) = lru_key else { return };
            if let Some(managed) = state.browsers.remove(&key) {
                warn!(
                    "Evicting LRU browser '{}' to stay within max_browsers={}",
                    key, self.config.max_browsers
                );
                spawn_close_browser(managed);
            }
        }
    }

    fn make_lease(self: &Arc<Self>, pool_key: &str, page_id: Uuid, page: Page) -> PageLease {
        PageLease {
            pool_key: pool_key.to_string(),
            page_id,
            page,
            inner: Arc::clone(self),
            runtime: tokio::runtime::Handle::current(),
            released: false,
        }
    }
}

fn mark_idle(state: &mut PoolState, pool_key: &str, page_id: Uuid) {
    if let Some(browser) = state.browsers.get_mut(pool_key) {
        if let Some(managed_page) = browser.pages.iter_mut().find(|p| p.id == page_id) {
            managed_page.in_use = false;
            managed_page.last_used = Instant::now();
        }
    }
}

async fn launch_browser(config: &PoolConfig, pool_key: &str) -> Result<ManagedBrowser, PoolError> {
    let mut builder = BrowserConfig::builder()
        .no_sandbox()
        .window_size(config.window_width, config.window_height)
        .args(BROWSER_ARGS.to_vec());
    if !config.headless {
        builder = builder.with_head();
    }

    let browser_config = builder.build().map_err(|message| PoolError::Launch {
        key: pool_key.to_string(),
        message,
    })?;

    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .map_err(|e| PoolError::Launch {
            key: pool_key.to_string(),
            message: e.to_string(),
        })?;

    // The handler stream drives all CDP traffic for this browser; it runs
    // until the websocket closes.
    let key_for_log = pool_key.to_string();
    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                debug!("Browser event error ('{}'): {}", key_for_log, e);
            }
        }
    });

    let now = Instant::now();
    Ok(ManagedBrowser {
        browser,
        handler_task,
        created_at: now,
        last_used: now,
        use_count: 0,
        pages: Vec::new(),
    })
}

async fn create_page(
    config: &PoolConfig,
    pool_key: &str,
    browser: &Browser,
) -> Result<ManagedPage, PoolError> {
    let page_create_error = |message: String| PoolError::PageCreate {
        key: pool_key.to_string(),
        message,
    };

    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| page_create_error(e.to_string()))?;

    // Baseline identity: fixed user agent, fixed viewport, fixed locale.
    page.execute(SetUserAgentOverrideParams::new(config.user_agent.clone()))
        .await
        .map_err(|e| page_create_error(e.to_string()))?;

    let metrics = SetDeviceMetricsOverrideParams::builder()
        .width(i64::from(config.window_width))
        .height(i64::from(config.window_height))
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(&page_create_error)?;
    page.execute(metrics)
        .await
        .map_err(|e| page_create_error(e.to_string()))?;

    let headers = Headers::new(serde_json::json!({
        "Accept-Language": config.accept_language,
    }));
    page.execute(SetExtraHttpHeadersParams::new(headers))
        .await
        .map_err(|e| page_create_error(e.to_string()))?;

    Ok(ManagedPage {
        id: Uuid::new_v4(),
        page,
        in_use: false,
        last_used: Instant::now(),
        use_count: 0,
    })
}

/// Best effort: blank navigation plus lifting any scraper-installed URL
/// blocks, so the next holder starts from a clean slate.
async fn reset_page(page: &Page) -> bool {
    if page.goto("about:blank").await.is_err() {
        return false;
    }
    page.execute(SetBlockedUrLsParams::new(Vec::<String>::new()))
        .await
        .is_ok()
}

fn spawn_close_page(page: Page) {
    tokio::spawn(async move {
        if let Err(e) = page.close().await {
            debug!("Force-close of page failed: {}", e);
        }
    });
}

pub(crate) async fn close_browser(mut managed: ManagedBrowser) {
    for managed_page in managed.pages.drain(..) {
        if let Err(e) = managed_page.page.close().await {
            debug!("Page close during browser shutdown failed: {}", e);
        }
    }
    if let Err(e) = managed.browser.close().await {
        debug!("Browser close failed: {}", e);
    }
    let _ = managed.browser.wait().await;
    managed.handler_task.abort();
}

pub(crate) fn spawn_close_browser(managed: ManagedBrowser) {
    tokio::spawn(close_browser(managed));
}
