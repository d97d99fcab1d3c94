//! Backpressure Controller (§4.J): `can_enqueue` gates admission, a 1 Hz ticker computes
//! arrival/drain rates, and level transitions emit events consumed by the Robustness layer and
//! the Message Engine's non-heartbeat shedding.
//!
//! Grounded on fc-router's `queue_health_monitor.rs` threshold-and-warning idiom, generalized
//! from per-queue backlog checks to the single global admission gate described in §4.J.

use fc_common::BackpressureLevel;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone)]
pub enum BackpressureEvent {
    LevelChanged(BackpressureLevel),
    QueueOverflow,
}

pub struct BackpressureConfig {
    pub max_queue_size: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self { max_queue_size: 10_000 }
    }
}

fn level_for(load: f64) -> BackpressureLevel {
    if load >= 0.95 {
        BackpressureLevel::Emergency
    } else if load >= 0.85 {
        BackpressureLevel::Critical
    } else if load >= 0.7 {
        BackpressureLevel::Warning
    } else {
        BackpressureLevel::Normal
    }
}

pub struct BackpressureController {
    current_size: AtomicU64,
    arrivals_this_second: AtomicU64,
    drains_this_second: AtomicU64,
    arrival_rate: RwLock<f64>,
    drain_rate: RwLock<f64>,
    level: RwLock<BackpressureLevel>,
    config: BackpressureConfig,
    events: broadcast::Sender<BackpressureEvent>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            current_size: AtomicU64::new(0),
            arrivals_this_second: AtomicU64::new(0),
            drains_this_second: AtomicU64::new(0),
            arrival_rate: RwLock::new(0.0),
            drain_rate: RwLock::new(0.0),
            level: RwLock::new(BackpressureLevel::Normal),
            config,
            events: tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackpressureEvent> {
        self.events.subscribe()
    }

    pub fn can_enqueue(&self) -> bool {
        self.current_size.load(Ordering::Relaxed) < self.config.max_queue_size
    }

    pub fn record_arrival(&self) {
        self.current_size.fetch_add(1, Ordering::Relaxed);
        self.arrivals_this_second.fetch_add(1, Ordering::Relaxed);
        self.reevaluate();
    }

    pub fn record_drain(&self) {
        self.current_size.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1))).ok();
        self.drains_this_second.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current_load(&self) -> f64 {
        self.current_size.load(Ordering::Relaxed) as f64 / self.config.max_queue_size as f64
    }

    pub fn level(&self) -> BackpressureLevel {
        *self.level.read()
    }

    pub fn should_shed_non_heartbeat(&self) -> bool {
        self.level() == BackpressureLevel::Emergency
    }

    fn reevaluate(&self) {
        let load = self.current_load();
        let new_level = level_for(load);
        let mut current = self.level.write();
        if new_level != *current {
            *current = new_level;
            info!(?new_level, load, "backpressure level changed");
            let _ = self.events.send(BackpressureEvent::LevelChanged(new_level));
            if new_level == BackpressureLevel::Emergency {
                let _ = self.events.send(BackpressureEvent::QueueOverflow);
            }
        }
    }

    /// Runs once per second: derives arrival/drain rates from the last second's counters and
    /// resets them (§4.J 1 Hz ticker).
    pub fn tick(&self) {
        let arrivals = self.arrivals_this_second.swap(0, Ordering::Relaxed);
        let drains = self.drains_this_second.swap(0, Ordering::Relaxed);
        *self.arrival_rate.write() = arrivals as f64;
        *self.drain_rate.write() = drains as f64;
    }

    pub fn arrival_rate(&self) -> f64 {
        *self.arrival_rate.read()
    }

    pub fn drain_rate(&self) -> f64 {
        *self.drain_rate.read()
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(BackpressureConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_enqueue_respects_max_size() {
        let controller = BackpressureController::new(BackpressureConfig { max_queue_size: 2 });
        assert!(controller.can_enqueue());
        controller.record_arrival();
        controller.record_arrival();
        assert!(!controller.can_enqueue());
    }

    #[test]
    fn level_escalates_with_load() {
        let controller = BackpressureController::new(BackpressureConfig { max_queue_size: 100 });
        for _ in 0..96 {
            controller.record_arrival();
        }
        assert_eq!(controller.level(), BackpressureLevel::Emergency);
        assert!(controller.should_shed_non_heartbeat());
    }

    #[test]
    fn tick_computes_rates_and_resets_counters() {
        let controller = BackpressureController::default();
        controller.record_arrival();
        controller.record_arrival();
        controller.record_drain();
        controller.tick();
        assert_eq!(controller.arrival_rate(), 2.0);
        assert_eq!(controller.drain_rate(), 1.0);
        controller.tick();
        assert_eq!(controller.arrival_rate(), 0.0);
    }
}
