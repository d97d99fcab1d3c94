//! Multi-Level Cache (§4.F), its access-pattern Strategy & Predictor (§4.G), and the
//! Preloader (§4.H) that feeds it ahead of demand.
//!
//! L1 is synchronous and in-process; L2 and L3 mirrors are fire-and-forget via the Service
//! pool so a slow disk or a down distributed tier never blocks the caller's `set`.

pub mod categories;
pub mod l1;
pub mod l2;
pub mod l3;
pub mod preloader;
pub mod strategy;

use categories::CategoryIndex;
use fc_common::{CacheItem, CacheLevel, CacheMetadata, CacheMetricsSnapshot, EvictionStrategy};
use fc_threadpool::{PoolKind, ThreadManager};
use l1::{L1Config, L1Store};
use l2::L2Store;
use l3::L3Store;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strategy::AccessTracker;
use tracing::{debug, trace};

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_DEMOTION_THRESHOLD: Duration = Duration::from_secs(100);
const OPTIMIZER_HOT_KEYS: usize = 20;
const PROMOTE_ACCESS_COUNT: u64 = 10;
const PROMOTE_PRIORITY: u8 = 50;
const PRELOAD_PRIORITY: u8 = 10;
/// §4.G health-alert thresholds: global hit rate below this, or average latency above it,
/// is surfaced to the Warning Service by the lifecycle's maintenance ticker.
const HEALTH_MIN_HIT_RATE: f64 = 0.5;
const HEALTH_MAX_AVG_LATENCY_US: f64 = 10_000.0;

pub struct CacheConfig {
    pub l1: L1Config,
    pub l2_root: PathBuf,
    pub l3_enabled: bool,
    pub cleanup_interval: Duration,
    pub demotion_threshold: Duration,
}

pub struct MultiLevelCache {
    l1: L1Store,
    l2: L2Store,
    l3: L3Store,
    categories: CategoryIndex,
    tracker: AccessTracker,
    total_requests: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
    evictions: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    demotion_threshold: Duration,
}

impl MultiLevelCache {
    pub fn new(config: CacheConfig) -> std::io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            l1: L1Store::new(config.l1),
            l2: L2Store::new(config.l2_root)?,
            l3: L3Store::disabled(),
            categories: CategoryIndex::new(),
            tracker: AccessTracker::new(),
            total_requests: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            max_latency_us: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            demotion_threshold: config.demotion_threshold,
        }))
    }

    pub fn set_eviction_strategy(&self, strategy: EvictionStrategy) {
        self.l1.set_strategy(strategy);
    }

    /// Synchronous write to L1; L2/L3 mirroring is dispatched onto the Service pool and never
    /// fails the caller's `set` (§4.F write path).
    pub fn set<T: Serialize>(
        self: &Arc<Self>,
        pool: &Arc<fc_threadpool::ProcessPool>,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        category: Option<String>,
        priority: u8,
    ) -> bool {
        let Ok(data) = serde_json::to_value(value) else { return false };
        let size = data.to_string().len() as u64;
        let metadata = CacheMetadata::new(ttl, category.clone(), priority, size, CacheLevel::L1);
        let item = CacheItem { data, metadata };

        let evicted = self.l1.insert(key.to_string(), item.clone());
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        if let Some(cat) = &category {
            self.categories.add(cat, key);
        }

        let this = self.clone();
        let key_owned = key.to_string();
        let _ = pool.submit(
            async move {
                this.l2.set(&key_owned, &item);
                if this.l3.is_enabled() {
                    this.l3.set(&key_owned, &item);
                }
            },
            fc_common::TaskPriority::Normal,
        );
        true
    }

    /// Probes L1 -> L2 -> L3, promoting on any hit below L1 (§4.F read path).
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let started = Instant::now();
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let result = if let Some(item) = self.l1.get(key) {
            self.record(key, CacheLevel::L1, true, started);
            Some(item)
        } else if let Some(item) = self.l2.get(key) {
            self.promote_from(key, &item, CacheLevel::L2);
            self.record(key, CacheLevel::L2, true, started);
            Some(item)
        } else if let Some(item) = self.l3.get(key) {
            self.promote_from(key, &item, CacheLevel::L3);
            self.record(key, CacheLevel::L3, true, started);
            Some(item)
        } else {
            self.record(key, CacheLevel::L1, false, started);
            None
        };

        result.and_then(|item| serde_json::from_value(item.data).ok())
    }

    fn promote_from(&self, key: &str, item: &CacheItem<serde_json::Value>, from: CacheLevel) {
        let mut promoted = item.clone();
        promoted.metadata.level = CacheLevel::L1;
        let evicted = self.l1.insert(key.to_string(), promoted);
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        self.promotions.fetch_add(1, Ordering::Relaxed);
        if from == CacheLevel::L3 {
            let mut for_l2 = item.clone();
            for_l2.metadata.level = CacheLevel::L2;
            self.l2.set(key, &for_l2);
        }
    }

    fn record(&self, key: &str, level: CacheLevel, hit: bool, started: Instant) {
        let latency = started.elapsed().as_micros() as u64;
        self.total_latency_us.fetch_add(latency, Ordering::Relaxed);
        self.max_latency_us.fetch_max(latency, Ordering::Relaxed);
        self.tracker.record(key, None, level, hit, latency);
        trace!(%key, ?level, hit, latency_us = latency, "cache access");
    }

    pub fn remove(&self, key: &str) -> bool {
        let l1 = self.l1.remove(key);
        let l2 = self.l2.remove(key);
        let l3 = self.l3.remove(key);
        if let Some(item) = &l1 {
            if let Some(cat) = &item.metadata.category {
                self.categories.remove(cat, key);
            }
        }
        l1.is_some() || l2 || l3
    }

    pub fn exists(&self, key: &str) -> bool {
        self.l1.contains(key) || self.l2.exists(key)
    }

    pub fn clear(&self) {
        self.l1.clear();
        self.l2.clear();
    }

    pub fn clear_category(&self, category: &str) {
        for key in self.categories.take_category(category) {
            self.remove(&key);
        }
    }

    pub fn set_many<T: Serialize>(
        self: &Arc<Self>,
        pool: &Arc<fc_threadpool::ProcessPool>,
        items: Vec<(String, T, Option<Duration>, Option<String>, u8)>,
    ) -> usize {
        let mut ok = 0;
        for (key, value, ttl, category, priority) in items {
            if self.set(pool, &key, &value, ttl, category, priority) {
                ok += 1;
            }
        }
        ok
    }

    pub fn get_many<T: DeserializeOwned>(&self, keys: &[String]) -> Vec<Option<T>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    pub fn remove_many(&self, keys: &[String]) -> usize {
        keys.iter().filter(|k| self.remove(k)).count()
    }

    /// Background maintenance: expiry sweep (all levels) plus the hot/cold optimizer
    /// (§4.F, runs every `cleanupInterval`/5 min respectively in the server's scheduler).
    pub fn maintenance_tick(&self) {
        let expired = self.l1.sweep_expired();
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired L1 entries swept");
        }
        self.l2.sweep_expired();
    }

    pub fn optimizer_tick(&self) {
        for key in self.l1.cold_keys(self.demotion_threshold) {
            if let Some(item) = self.l1.peek(&key) {
                if item.metadata.access_count > PROMOTE_ACCESS_COUNT && item.metadata.priority > PROMOTE_PRIORITY {
                    continue;
                }
                self.l2.set(&key, &item);
                self.l1.remove(&key);
                self.demotions.fetch_add(1, Ordering::Relaxed);
            }
        }
        let _ = self.l1.top_hot_keys(OPTIMIZER_HOT_KEYS);
    }

    pub fn tracker(&self) -> &AccessTracker {
        &self.tracker
    }

    /// Reads a key from the backing tiers (L2, then L3) without touching L1 or the
    /// request/latency metrics — used by the preloader to warm L1 from what's already on
    /// disk/remote rather than re-running whatever produced the value originally.
    pub fn peek_backing(&self, key: &str) -> Option<serde_json::Value> {
        self.l2.get(key).or_else(|| self.l3.get(key)).map(|item| item.data)
    }

    /// Writes a preloaded value straight into L1 at a low priority so it's the first thing
    /// evicted if real traffic needs the room back.
    pub fn preload_set(&self, key: String, value: serde_json::Value) {
        let size = value.to_string().len() as u64;
        let metadata = CacheMetadata::new(None, None, PRELOAD_PRIORITY, size, CacheLevel::L1);
        let evicted = self.l1.insert(key, CacheItem { data: value, metadata });
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
    }

    /// `Some((hit_rate, avg_latency_us))` when the global hit rate or latency has crossed
    /// into unhealthy territory (§4.G); `None` otherwise. The caller decides how to surface
    /// this (edge-triggered warning, typically).
    pub fn health_alert(&self) -> Option<(f64, f64)> {
        // a handful of cold-start requests shouldn't trip the alarm before there's a real sample
        if self.total_requests.load(Ordering::Relaxed) < 20 {
            return None;
        }
        let hit_rate = self.tracker.hit_rate();
        let avg_latency = self.tracker.average_latency_us();
        if hit_rate < HEALTH_MIN_HIT_RATE || avg_latency > HEALTH_MAX_AVG_LATENCY_US {
            Some((hit_rate, avg_latency))
        } else {
            None
        }
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let avg = if total == 0 {
            0.0
        } else {
            self.total_latency_us.load(Ordering::Relaxed) as f64 / total as f64
        };
        CacheMetricsSnapshot {
            l1: self.l1.stats(),
            l2: self.l2.stats(0, 0),
            l3: self.l3.stats(),
            total_requests: total,
            average_latency_us: avg,
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
        }
    }
}

/// Convenience accessor matching the Service pool other components use for fire-and-forget
/// mirroring and preloading (§4.A, Service pool).
pub fn service_pool(manager: &ThreadManager) -> Arc<fc_threadpool::ProcessPool> {
    manager.pool(PoolKind::Service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_threadpool::ThreadManager;

    fn setup() -> (Arc<MultiLevelCache>, Arc<ThreadManager>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = MultiLevelCache::new(CacheConfig {
            l1: L1Config::default(),
            l2_root: dir.path().to_path_buf(),
            l3_enabled: false,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            demotion_threshold: DEFAULT_DEMOTION_THRESHOLD,
        })
        .unwrap();
        std::mem::forget(dir);
        let manager = Arc::new(ThreadManager::new());
        (cache, manager)
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_l1() {
        let (cache, manager) = setup();
        let pool = service_pool(&manager);
        assert!(cache.set(&pool, "k", &"v".to_string(), None, None, 50));
        let got: Option<String> = cache.get("k");
        assert_eq!(got, Some("v".to_string()));
    }

    #[tokio::test]
    async fn clear_category_removes_only_that_categorys_keys() {
        let (cache, manager) = setup();
        let pool = service_pool(&manager);
        cache.set(&pool, "a", &1, None, Some("cat".into()), 50);
        cache.set(&pool, "b", &2, None, None, 50);
        cache.clear_category("cat");
        assert!(!cache.exists("a"));
        assert!(cache.exists("b"));
    }

    #[tokio::test]
    async fn missing_key_is_a_clean_miss() {
        let (cache, _manager) = setup();
        let got: Option<String> = cache.get("nope");
        assert_eq!(got, None);
    }
}
