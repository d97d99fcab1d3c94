//! L3: distributed store interface (§4.F). When disabled or disconnected every operation is a
//! no-op; reconnection is attempted lazily on the next call and consecutive failures are
//! reported to the robustness layer's circuit breaker registry rather than handled here.

use fc_common::{CacheItem, CacheLevelStats};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Pluggable backend for the distributed tier. A real deployment wires in a Redis or
/// memcached client; tests and standalone deployments use `NoopL3Backend`.
pub trait L3Backend: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, bytes: Vec<u8>) -> bool;
    fn remove(&self, key: &str) -> bool;
    fn is_connected(&self) -> bool;
}

pub struct NoopL3Backend;

impl L3Backend for NoopL3Backend {
    fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }
    fn set(&self, _key: &str, _bytes: Vec<u8>) -> bool {
        false
    }
    fn remove(&self, _key: &str) -> bool {
        false
    }
    fn is_connected(&self) -> bool {
        false
    }
}

pub struct L3Store {
    backend: Box<dyn L3Backend>,
    enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    consecutive_failures: AtomicU64,
}

impl L3Store {
    pub fn new(backend: Box<dyn L3Backend>, enabled: bool) -> Self {
        Self {
            backend,
            enabled: AtomicBool::new(enabled),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Box::new(NoopL3Backend), false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn get(&self, key: &str) -> Option<CacheItem<serde_json::Value>> {
        if !self.enabled.load(Ordering::Relaxed) || !self.backend.is_connected() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        match self.backend.get(key).and_then(|b| serde_json::from_slice(&b).ok()) {
            Some(item) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: &str, item: &CacheItem<serde_json::Value>) -> bool {
        if !self.enabled.load(Ordering::Relaxed) || !self.backend.is_connected() {
            return false;
        }
        let Ok(bytes) = serde_json::to_vec(item) else { return false };
        let ok = self.backend.set(key, bytes);
        if ok {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub fn remove(&self, key: &str) -> bool {
        if !self.enabled.load(Ordering::Relaxed) {
            return false;
        }
        self.backend.remove(key)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheLevelStats {
        CacheLevelStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: 0,
            count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_store_is_a_noop() {
        let store = L3Store::disabled();
        assert!(store.get("k").is_none());
        assert!(!store.set("k", &CacheItem { data: serde_json::json!(1), metadata: fc_common::CacheMetadata::new(None, None, 50, 1, fc_common::CacheLevel::L3) }));
    }
}
