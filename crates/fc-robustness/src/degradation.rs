//! Performance Degradation Manager (§4.I): derives a `DegradationLevel` from a system-load
//! snapshot and invokes the handler registered for the newly-entered level.

use fc_common::DegradationLevel;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLoad {
    pub cpu_pct: u8,
    pub memory_pct: u8,
    pub disk_io_pct: u8,
    pub net_io_pct: u8,
    pub avg_response_time_ms: u32,
}

/// Weighted worst-signal rule: a single overloaded dimension drives the level even if the
/// others are nominal.
pub fn classify(load: &SystemLoad) -> DegradationLevel {
    let signals = [
        bucket(load.cpu_pct),
        bucket(load.memory_pct),
        bucket(load.disk_io_pct),
        bucket(load.net_io_pct),
        bucket_response_time(load.avg_response_time_ms),
    ];
    *signals.iter().max().unwrap()
}

fn bucket(pct: u8) -> DegradationLevel {
    match pct {
        0..=59 => DegradationLevel::Normal,
        60..=74 => DegradationLevel::Light,
        75..=84 => DegradationLevel::Moderate,
        85..=94 => DegradationLevel::Heavy,
        _ => DegradationLevel::Emergency,
    }
}

fn bucket_response_time(ms: u32) -> DegradationLevel {
    match ms {
        0..=199 => DegradationLevel::Normal,
        200..=499 => DegradationLevel::Light,
        500..=999 => DegradationLevel::Moderate,
        1000..=2999 => DegradationLevel::Heavy,
        _ => DegradationLevel::Emergency,
    }
}

pub type DegradationHandler = Arc<dyn Fn() + Send + Sync>;

pub struct DegradationManager {
    current: RwLock<DegradationLevel>,
    handlers: RwLock<Vec<(DegradationLevel, DegradationHandler)>>,
}

impl DegradationManager {
    pub fn new() -> Self {
        Self { current: RwLock::new(DegradationLevel::Normal), handlers: RwLock::new(Vec::new()) }
    }

    pub fn register_handler(&self, level: DegradationLevel, handler: DegradationHandler) {
        self.handlers.write().push((level, handler));
    }

    pub fn current_level(&self) -> DegradationLevel {
        *self.current.read()
    }

    /// Recomputes the level from `load`; if it changed, runs every handler registered for the
    /// new level and returns it.
    pub fn evaluate(&self, load: &SystemLoad) -> Option<DegradationLevel> {
        let level = classify(load);
        let mut current = self.current.write();
        if level == *current {
            return None;
        }
        *current = level;
        drop(current);

        info!(?level, "degradation level changed");
        for (handler_level, handler) in self.handlers.read().iter() {
            if *handler_level == level {
                handler();
            }
        }
        Some(level)
    }
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn worst_signal_drives_the_level() {
        let load = SystemLoad { cpu_pct: 10, memory_pct: 96, disk_io_pct: 10, net_io_pct: 10, avg_response_time_ms: 10 };
        assert_eq!(classify(&load), DegradationLevel::Emergency);
    }

    #[test]
    fn handler_for_new_level_runs_once() {
        let manager = DegradationManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        manager.register_handler(DegradationLevel::Heavy, Arc::new(move || fired2.store(true, Ordering::Relaxed)));
        let load = SystemLoad { cpu_pct: 90, memory_pct: 10, disk_io_pct: 10, net_io_pct: 10, avg_response_time_ms: 10 };
        assert_eq!(manager.evaluate(&load), Some(DegradationLevel::Heavy));
        assert!(fired.load(Ordering::Relaxed));
    }

    #[test]
    fn unchanged_level_does_not_refire() {
        let manager = DegradationManager::new();
        let load = SystemLoad::default();
        assert_eq!(manager.evaluate(&load), None);
    }
}
