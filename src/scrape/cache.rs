//! TTL cache for scrape results
//!
//! Keyed by `"{pool_key}:{gtin}"`. Expired entries are deleted lazily on
//! read; once the entry count crosses a high-water mark, the next insert
//! sweeps everything expired. A simple bound against unbounded growth,
//! intentionally not an LRU.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use super::PriceResult;

struct CacheEntry {
    result: PriceResult,
    expires_at: Instant,
}

pub struct ResultCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    high_water: usize,
}

impl ResultCache {
    pub fn new(ttl: Duration, high_water: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            high_water,
        }
    }

    pub fn cache_key(pool_key: &str, gtin: &str) -> String {
        format!("{pool_key}:{gtin}")
    }

    /// Look up a fresh entry; an expired one is removed on the spot.
    pub async fn get(&self, key: &str) -> Option<PriceResult> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.result.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Entry exists but is stale: upgrade to a write lock and delete it.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.result.clone());
            }
            entries.remove(key);
            debug!("Cache entry '{}' expired, removed", key);
        }
        None
    }

    /// Store a successful result with a fresh expiry.
    pub async fn insert(&self, key: String, result: PriceResult) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CacheEntry {
                result,
                expires_at: Instant::now() + self.ttl,
            },
        );

        if entries.len() > self.high_water {
            let before = entries.len();
            let now = Instant::now();
            entries.retain(|_, entry| entry.expires_at > now);
            debug!(
                "Cache sweep: {} -> {} entries (high water {})",
                before,
                entries.len(),
                self.high_water
            );
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priced(price: f64) -> PriceResult {
        PriceResult {
            price: Some(price),
            product_url: Some("https://example.test/p/1".to_string()),
            error: None,
        }
    }

    #[tokio::test]
    async fn fresh_entry_is_returned() {
        let cache = ResultCache::new(Duration::from_secs(60), 100);
        cache.insert("dm-scraper:4005808229741".to_string(), priced(3.45)).await;

        let hit = cache.get("dm-scraper:4005808229741").await.expect("hit");
        assert_eq!(hit.price, Some(3.45));
    }

    #[tokio::test]
    async fn expired_entry_is_removed_on_read() {
        let cache = ResultCache::new(Duration::from_millis(20), 100);
        cache.insert("k".to_string(), priced(1.0)).await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.len().await, 0, "stale entry must be deleted on read");
    }

    #[tokio::test]
    async fn insert_past_high_water_sweeps_expired() {
        let cache = ResultCache::new(Duration::from_millis(20), 3);
        for i in 0..4 {
            cache.insert(format!("k{i}"), priced(f64::from(i))).await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        // 5th insert crosses the high-water mark with everything expired
        cache.insert("fresh".to_string(), priced(9.99)).await;

        assert_eq!(cache.len().await, 1);
        assert!(cache.get("fresh").await.is_some());
    }

    #[test]
    fn cache_key_joins_pool_key_and_gtin() {
        assert_eq!(
            ResultCache::cache_key("dm-scraper", "4005808229741"),
            "dm-scraper:4005808229741"
        );
    }
}
