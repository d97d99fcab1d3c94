//! Thread Manager (§4.A): five categorized worker pools with priority queues,
//! auto-resize, rate limiting, and aggregate health reporting.
//!
//! Concurrency is bounded with a `tokio::sync::Semaphore` sized to the pool's current `max`
//! rather than by spawning and joining a fixed set of OS threads — resizing is then just
//! adding or forgetting permits, which keeps the dispatcher loop itself trivial.

mod pool;

pub use pool::{PoolHandle, PoolStatsSnapshot, ProcessPool, ProcessPoolConfig, SubmitError, TaskHandle};

use dashmap::DashMap;
use fc_common::{PoolStats, TaskPriority};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// One of the five fixed pool categories (§4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Network,
    Message,
    Database,
    File,
    Service,
}

impl PoolKind {
    pub fn name(self) -> &'static str {
        match self {
            PoolKind::Network => "network",
            PoolKind::Message => "message",
            PoolKind::Database => "database",
            PoolKind::File => "file",
            PoolKind::Service => "service",
        }
    }

    /// Compiled-in `{min, max}` defaults from §4.A.
    pub fn defaults(self) -> (u32, u32) {
        match self {
            PoolKind::Network => (2, 4),
            PoolKind::Message => (4, 8),
            PoolKind::Database => (2, 6),
            PoolKind::File => (2, 4),
            PoolKind::Service => (1, 2),
        }
    }
}

pub type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Owns the five pools, aggregates health, and drives each pool's auto-resize ticker.
pub struct ThreadManager {
    pools: DashMap<&'static str, Arc<ProcessPool>>,
}

impl ThreadManager {
    pub fn new() -> Self {
        let pools = DashMap::new();
        for kind in [
            PoolKind::Network,
            PoolKind::Message,
            PoolKind::Database,
            PoolKind::File,
            PoolKind::Service,
        ] {
            let (min, max) = kind.defaults();
            let pool = Arc::new(ProcessPool::new(ProcessPoolConfig {
                name: kind.name().to_string(),
                min,
                max,
                hard_max: max * 4,
                auto_resize: true,
                load_threshold: 0.75,
                rate_limit_per_minute: None,
            }));
            pools.insert(kind.name(), pool);
        }
        Self { pools }
    }

    pub fn pool(&self, kind: PoolKind) -> Arc<ProcessPool> {
        self.pools
            .get(kind.name())
            .expect("all five pools are registered at construction")
            .clone()
    }

    /// Spawns the auto-resize tickers (§4.A: evaluated every 5s). Call once at startup.
    pub fn spawn_auto_resize(self: &Arc<Self>) {
        for entry in self.pools.iter() {
            let pool = entry.value().clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(5));
                loop {
                    tick.tick().await;
                    pool.auto_resize_tick();
                }
            });
        }
    }

    /// §4.A health predicate, aggregated across all five pools.
    pub fn is_healthy(&self) -> bool {
        let mut total_queued = 0u32;
        let mut total_active = 0u32;
        let mut total_failed = 0u64;
        let mut total_completed = 0u64;
        for entry in self.pools.iter() {
            let stats = entry.value().stats();
            total_queued += stats.queued;
            total_active += stats.active;
            total_failed += stats.failed_tasks;
            total_completed += stats.completed_tasks;
        }
        let total_tasks = total_completed + total_failed;
        let failure_rate = if total_tasks == 0 {
            0.0
        } else {
            total_failed as f64 / total_tasks as f64
        };
        total_queued < 1000 && failure_rate < 0.05 && total_active < 50
    }

    pub fn all_stats(&self) -> Vec<PoolStats> {
        self.pools
            .iter()
            .map(|entry| {
                let s = entry.value().stats();
                PoolStats {
                    name: entry.key().to_string(),
                    min: s.min,
                    max: s.max,
                    active: s.active,
                    queued: s.queued,
                    failed_tasks: s.failed_tasks,
                }
            })
            .collect()
    }

    pub fn log_startup(&self) {
        for entry in self.pools.iter() {
            let s = entry.value().stats();
            info!(pool = entry.key(), min = s.min, max = s.max, "thread pool ready");
        }
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_manager_is_healthy() {
        let mgr = ThreadManager::new();
        assert!(mgr.is_healthy());
    }

    #[tokio::test]
    async fn all_five_pools_registered_with_spec_defaults() {
        let mgr = ThreadManager::new();
        let net = mgr.pool(PoolKind::Network).stats();
        assert_eq!((net.min, net.max), (2, 4));
        let msg = mgr.pool(PoolKind::Message).stats();
        assert_eq!((msg.min, msg.max), (4, 8));
        let db = mgr.pool(PoolKind::Database).stats();
        assert_eq!((db.min, db.max), (2, 6));
    }
}
