//! L1: in-memory store with configurable eviction (§4.F).

use dashmap::DashMap;
use fc_common::{CacheItem, CacheLevel, CacheLevelStats, CacheMetadata, EvictionStrategy};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct L1Config {
    pub max_items: u64,
    pub max_size_bytes: u64,
    pub strategy: EvictionStrategy,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_items: 10_000,
            max_size_bytes: 64 * 1024 * 1024,
            strategy: EvictionStrategy::Lru,
        }
    }
}

pub struct L1Store {
    items: DashMap<String, CacheItem<serde_json::Value>>,
    config: RwLock<L1Config>,
    size_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl L1Store {
    pub fn new(config: L1Config) -> Self {
        Self {
            items: DashMap::new(),
            config: RwLock::new(config),
            size_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn set_strategy(&self, strategy: EvictionStrategy) {
        self.config.write().strategy = strategy;
    }

    /// Returns how many entries `maybe_evict` removed to make room for this insert.
    pub fn insert(&self, key: String, item: CacheItem<serde_json::Value>) -> usize {
        if let Some(old) = self.items.get(&key) {
            self.size_bytes.fetch_sub(old.metadata.size, Ordering::Relaxed);
        }
        self.size_bytes.fetch_add(item.metadata.size, Ordering::Relaxed);
        self.items.insert(key, item);
        self.maybe_evict()
    }

    /// Returns the item, treating an expired entry as absent and removing it (§4.F expiration).
    pub fn get(&self, key: &str) -> Option<CacheItem<serde_json::Value>> {
        let expired = match self.items.get(key) {
            Some(e) => e.metadata.is_expired(),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            self.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut entry = self.items.get_mut(key)?;
        entry.metadata.record_access();
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.clone())
    }

    pub fn peek(&self, key: &str) -> Option<CacheItem<serde_json::Value>> {
        self.items.get(key).map(|e| e.value().clone())
    }

    pub fn remove(&self, key: &str) -> Option<CacheItem<serde_json::Value>> {
        let removed = self.items.remove(key).map(|(_, v)| v);
        if let Some(item) = &removed {
            self.size_bytes.fetch_sub(item.metadata.size, Ordering::Relaxed);
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.get(key).map(|e| !e.metadata.is_expired()).unwrap_or(false)
    }

    pub fn clear(&self) {
        self.items.clear();
        self.size_bytes.store(0, Ordering::Relaxed);
    }

    pub fn sweep_expired(&self) -> Vec<String> {
        let expired: Vec<String> = self
            .items
            .iter()
            .filter(|e| e.value().metadata.is_expired())
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired
    }

    pub fn stats(&self) -> CacheLevelStats {
        CacheLevelStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.size_bytes.load(Ordering::Relaxed),
            count: self.items.len() as u64,
        }
    }

    /// Demotion candidates: entries untouched for longer than `threshold` (§4.F optimizer).
    pub fn cold_keys(&self, threshold: Duration) -> Vec<String> {
        let now = chrono::Utc::now();
        self.items
            .iter()
            .filter(|e| {
                let age = now - e.value().metadata.last_accessed;
                age.to_std().map(|d| d > threshold).unwrap_or(false)
            })
            .map(|e| e.key().clone())
            .collect()
    }

    /// Hot-key candidates: highest `hotness`, for the promotion-assurance optimizer (§4.F).
    pub fn top_hot_keys(&self, n: usize) -> Vec<String> {
        let mut all: Vec<(String, u64)> = self.items.iter().map(|e| (e.key().clone(), e.value().metadata.hotness)).collect();
        all.sort_by(|a, b| b.1.cmp(&a.1));
        all.into_iter().take(n).map(|(k, _)| k).collect()
    }

    /// Evicts down to 80% of both the item-count and byte-size limits, returning how many
    /// entries were removed. Either bound alone can drive the loop: a handful of oversized
    /// entries can blow `max_size_bytes` while the item count stays well under `max_items`.
    fn maybe_evict(&self) -> usize {
        let config = self.config.read();
        let over_count = self.items.len() as u64 > config.max_items;
        let over_size = self.size_bytes.load(Ordering::Relaxed) > config.max_size_bytes;
        if !over_count && !over_size {
            return 0;
        }
        let target_count = (config.max_items * 80 / 100).max(1);
        let target_size = (config.max_size_bytes / 100 * 80).max(1);
        let strategy = config.strategy;
        drop(config);

        if strategy == EvictionStrategy::Ttl {
            for key in self.sweep_expired() {
                tracing::trace!(%key, "evicted expired entry");
            }
        }

        let mut evicted = 0;
        while self.items.len() as u64 > target_count || self.size_bytes.load(Ordering::Relaxed) > target_size {
            let victim = self.pick_victim(strategy);
            match victim {
                Some(key) => {
                    self.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    fn pick_victim(&self, strategy: EvictionStrategy) -> Option<String> {
        use fc_common::CacheMetadata as Meta;
        fn tie_break(a: &Meta, b: &Meta) -> std::cmp::Ordering {
            a.priority.cmp(&b.priority).then(a.hotness.cmp(&b.hotness))
        }

        let mut best: Option<(String, &'static str)> = None;
        let mut best_meta: Option<CacheMetadata> = None;

        for entry in self.items.iter() {
            let meta = entry.value().metadata.clone();
            let replace = match (&best_meta, strategy) {
                (None, _) => true,
                (Some(cur), EvictionStrategy::Lru) | (Some(cur), EvictionStrategy::Ttl) => {
                    meta.last_accessed < cur.last_accessed
                        || (meta.last_accessed == cur.last_accessed && tie_break(&meta, cur) == std::cmp::Ordering::Less)
                }
                (Some(cur), EvictionStrategy::Lfu) => {
                    meta.access_count < cur.access_count
                        || (meta.access_count == cur.access_count && tie_break(&meta, cur) == std::cmp::Ordering::Less)
                }
                (Some(cur), EvictionStrategy::Fifo) => {
                    meta.created_at < cur.created_at
                        || (meta.created_at == cur.created_at && tie_break(&meta, cur) == std::cmp::Ordering::Less)
                }
                (Some(_), EvictionStrategy::Random) => rand::random::<bool>(),
            };
            if replace {
                best = Some((entry.key().clone(), ""));
                best_meta = Some(meta);
            }
        }
        best.map(|(k, _)| k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::CacheLevel;

    fn item(priority: u8, size: u64) -> CacheItem<serde_json::Value> {
        CacheItem {
            data: serde_json::json!({"v": 1}),
            metadata: CacheMetadata::new(None, None, priority, size, CacheLevel::L1),
        }
    }

    #[test]
    fn lru_evicts_least_recently_accessed() {
        let store = L1Store::new(L1Config { max_items: 2, max_size_bytes: u64::MAX, strategy: EvictionStrategy::Lru });
        store.insert("a".into(), item(50, 1));
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.insert("b".into(), item(50, 1));
        store.get("b");
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.insert("c".into(), item(50, 1));
        assert!(!store.contains("a"));
    }

    #[test]
    fn get_on_expired_item_is_a_miss_and_removes_it() {
        let store = L1Store::new(L1Config::default());
        let mut it = item(50, 1);
        it.metadata.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        store.items.insert("k".into(), it);
        assert!(store.get("k").is_none());
        assert!(!store.contains("k"));
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let store = L1Store::new(L1Config::default());
        store.insert("a".into(), item(50, 1));
        store.get("a");
        store.get("missing");
        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
