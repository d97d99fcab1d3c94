//! Memory Monitor (§4.I): samples process memory every 5 s, firing threshold-crossing events
//! and running registered cleanup handlers in order.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub const WARNING_THRESHOLD: u8 = 80;
pub const CRITICAL_THRESHOLD: u8 = 90;
pub const EMERGENCY_THRESHOLD: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

fn level_for(pct: u8) -> MemoryLevel {
    if pct >= EMERGENCY_THRESHOLD {
        MemoryLevel::Emergency
    } else if pct >= CRITICAL_THRESHOLD {
        MemoryLevel::Critical
    } else if pct >= WARNING_THRESHOLD {
        MemoryLevel::Warning
    } else {
        MemoryLevel::Normal
    }
}

/// `(reclaimed bytes, ok)` returned by a cleanup handler (§4.I).
pub type CleanupResult = (u64, bool);
pub type CleanupHandler = Arc<dyn Fn() -> CleanupResult + Send + Sync>;

/// Supplies the current memory usage percentage; production wiring samples `/proc/self/status`
/// or an allocator's stats, tests inject a fixed or scripted value.
pub trait MemorySampler: Send + Sync {
    fn sample_percent(&self) -> u8;
}

pub struct MemoryMonitor<S: MemorySampler> {
    sampler: S,
    last_level: RwLock<MemoryLevel>,
    handlers: RwLock<Vec<CleanupHandler>>,
}

impl<S: MemorySampler> MemoryMonitor<S> {
    pub fn new(sampler: S) -> Self {
        Self { sampler, last_level: RwLock::new(MemoryLevel::Normal), handlers: RwLock::new(Vec::new()) }
    }

    pub fn register_cleanup_handler(&self, handler: CleanupHandler) {
        self.handlers.write().push(handler);
    }

    /// Runs one sample; returns the level if it just crossed a threshold, running cleanup
    /// handlers in registration order when it did.
    pub fn tick(&self) -> Option<MemoryLevel> {
        let pct = self.sampler.sample_percent();
        let level = level_for(pct);
        let mut last = self.last_level.write();
        if level == *last {
            return None;
        }
        *last = level;
        drop(last);

        if level > MemoryLevel::Normal {
            warn!(pct, ?level, "memory threshold crossed");
            for handler in self.handlers.read().iter() {
                let (reclaimed, ok) = handler();
                info!(reclaimed, ok, "cleanup handler ran");
            }
        } else {
            info!("memory usage back to normal");
        }
        Some(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU8 as AU8;

    struct Fixed(AU8);
    impl MemorySampler for Fixed {
        fn sample_percent(&self) -> u8 {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn crossing_warning_threshold_runs_handlers() {
        let monitor = MemoryMonitor::new(Fixed(AU8::new(50)));
        let ran = Arc::new(AtomicU8::new(0));
        let ran2 = ran.clone();
        monitor.register_cleanup_handler(Arc::new(move || {
            ran2.fetch_add(1, Ordering::Relaxed);
            (1024, true)
        }));
        assert_eq!(monitor.tick(), None);
        monitor.sampler.0.store(85, Ordering::Relaxed);
        assert_eq!(monitor.tick(), Some(MemoryLevel::Warning));
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn repeated_same_level_does_not_refire() {
        let monitor = MemoryMonitor::new(Fixed(AU8::new(96)));
        assert_eq!(monitor.tick(), Some(MemoryLevel::Emergency));
        assert_eq!(monitor.tick(), None);
    }
}
