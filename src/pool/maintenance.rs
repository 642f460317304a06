//! Background pool maintenance
//!
//! One task per pool, on a fixed interval, independent of any request:
//! samples memory for the whole process tree (Chromium renderers are
//! grandchildren of this process) and reclaims idle resources. Browsers
//! are by far the most expensive and leak-prone resource here, so
//! reclamation is proactive rather than caller-driven.

use chromiumoxide::Page;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::browser_pool::{ManagedBrowser, PoolInner, close_browser};

pub(crate) fn spawn_maintenance(inner: Arc<PoolInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(inner.config.maintenance_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so a freshly
        // created pool does not run a no-op sweep.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => {
                    debug!("Pool maintenance task stopped");
                    break;
                }
                _ = interval.tick() => {
                    run_memory_check(&inner).await;
                    run_idle_eviction(&inner).await;
                }
            }
        }
    })
}

/// Two-stage pressure relief: close every idle page pool-wide, and if
/// that is not enough, close the least-recently-used half of browsers.
async fn run_memory_check(inner: &Arc<PoolInner>) {
    let ceiling = inner.config.memory_ceiling_mb;
    let used = sample_process_tree_mb().await;
    if used <= ceiling {
        return;
    }
    warn!(
        "⚠️ Memory usage {}MB above ceiling {}MB; closing idle pages",
        used, ceiling
    );

    let idle_pages = {
        let mut state = inner.state.lock().await;
        let mut closed: Vec<Page> = Vec::new();
        for browser in state.browsers.values_mut() {
            let mut kept = Vec::with_capacity(browser.pages.len());
            for managed_page in browser.pages.drain(..) {
                if managed_page.in_use {
                    kept.push(managed_page);
                } else {
                    closed.push(managed_page.page);
                }
            }
            browser.pages = kept;
        }
        closed
    };
    info!("Closed {} idle pages under memory pressure", idle_pages.len());
    for page in idle_pages {
        if let Err(e) = page.close().await {
            debug!("Idle page close failed: {}", e);
        }
    }

    let used = sample_process_tree_mb().await;
    if used <= ceiling {
        return;
    }
    warn!(
        "Memory usage {}MB still above ceiling; closing LRU half of browsers",
        used
    );

    let victims: Vec<(String, ManagedBrowser)> = {
        let mut state = inner.state.lock().await;
        let mut by_age: Vec<(String, Instant)> = state
            .browsers
            .iter()
            .map(|(key, browser)| (key.clone(), browser.last_used))
            .collect();
        by_age.sort_by_key(|(_, last_used)| *last_used);

        let victim_count = (by_age.len() / 2).max(1);
        by_age
            .into_iter()
            .take(victim_count)
            .filter_map(|(key, _)| state.browsers.remove(&key).map(|b| (key, b)))
            .collect()
    };

    for (key, managed) in victims {
        info!("Closing browser '{}' under memory pressure", key);
        close_browser(managed).await;
    }
}

/// Idle reclamation: a browser untouched past the idle threshold is
/// closed whole (with all its pages); inside a still-active browser,
/// individual pages idle past half the threshold are drained so page
/// count shrinks without killing a useful browser.
async fn run_idle_eviction(inner: &Arc<PoolInner>) {
    let browser_idle = inner.config.browser_idle_timeout();
    let page_idle = browser_idle / 2;
    let now = Instant::now();

    let (expired_browsers, drained_pages) = {
        let mut state = inner.state.lock().await;

        let expired_keys: Vec<String> = state
            .browsers
            .iter()
            .filter(|(_, browser)| {
                now.duration_since(browser.last_used) > browser_idle
                    && browser.pages.iter().all(|p| !p.in_use)
            })
            .map(|(key, _)| key.clone())
            .collect();

        let mut expired = Vec::new();
        for key in expired_keys {
            if let Some(managed) = state.browsers.remove(&key) {
                info!(
                    "Closing idle browser '{}' (unused for {:?})",
                    key,
                    now.duration_since(managed.last_used)
                );
                expired.push(managed);
            }
        }

        let mut drained: Vec<Page> = Vec::new();
        for (key, browser) in state.browsers.iter_mut() {
            let before = browser.pages.len();
            let mut kept = Vec::with_capacity(before);
            for managed_page in browser.pages.drain(..) {
                if !managed_page.in_use && now.duration_since(managed_page.last_used) > page_idle {
                    drained.push(managed_page.page);
                } else {
                    kept.push(managed_page);
                }
            }
            browser.pages = kept;
            if browser.pages.len() < before {
                debug!(
                    "Drained {} idle pages from browser '{}'",
                    before - browser.pages.len(),
                    key
                );
            }
        }

        (expired, drained)
    };

    for page in drained_pages {
        if let Err(e) = page.close().await {
            debug!("Idle page close failed: {}", e);
        }
    }
    for managed in expired_browsers {
        close_browser(managed).await;
    }
}

/// RSS of this process plus its transitive children, in megabytes.
pub(crate) async fn sample_process_tree_mb() -> u64 {
    tokio::task::spawn_blocking(sample_sync).await.unwrap_or(0)
}

fn sample_sync() -> u64 {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All);

    let root = Pid::from_u32(std::process::id());
    let mut tree: HashSet<Pid> = HashSet::new();
    tree.insert(root);

    // Renderers hang off the main Chromium process, so walk the parent
    // chain until the set stops growing.
    loop {
        let mut grew = false;
        for (pid, process) in sys.processes() {
            if tree.contains(pid) {
                continue;
            }
            if let Some(parent) = process.parent() {
                if tree.contains(&parent) {
                    tree.insert(*pid);
                    grew = true;
                }
            }
        }
        if !grew {
            break;
        }
    }

    let bytes: u64 = sys
        .processes()
        .iter()
        .filter(|(pid, _)| tree.contains(pid))
        .map(|(_, process)| process.memory())
        .sum();
    bytes / (1024 * 1024)
}
