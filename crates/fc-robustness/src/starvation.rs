//! Thread-starvation Detector (§4.I): registered threads report heartbeats; a thread silent
//! for longer than `starvationThreshold` triggers `ThreadStarvationDetected`.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

pub const DEFAULT_STARVATION_THRESHOLD: Duration = Duration::from_secs(30);

pub struct StarvationDetector {
    heartbeats: DashMap<String, Instant>,
    threshold: Duration,
}

impl StarvationDetector {
    pub fn new(threshold: Duration) -> Self {
        Self { heartbeats: DashMap::new(), threshold }
    }

    pub fn register(&self, name: impl Into<String>) {
        self.heartbeats.insert(name.into(), Instant::now());
    }

    pub fn heartbeat(&self, name: &str) {
        if let Some(mut entry) = self.heartbeats.get_mut(name) {
            *entry = Instant::now();
        }
    }

    /// Returns the names of threads currently starved.
    pub fn check(&self) -> Vec<String> {
        let starved: Vec<String> = self
            .heartbeats
            .iter()
            .filter(|e| e.value().elapsed() > self.threshold)
            .map(|e| e.key().clone())
            .collect();
        for name in &starved {
            warn!(%name, "thread starvation detected");
        }
        starved
    }
}

impl Default for StarvationDetector {
    fn default() -> Self {
        Self::new(DEFAULT_STARVATION_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_thread_is_flagged_after_threshold() {
        let detector = StarvationDetector::new(Duration::from_millis(10));
        detector.register("worker-1");
        assert!(detector.check().is_empty());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(detector.check(), vec!["worker-1".to_string()]);
    }

    #[test]
    fn heartbeat_resets_the_clock() {
        let detector = StarvationDetector::new(Duration::from_millis(20));
        detector.register("worker-1");
        std::thread::sleep(Duration::from_millis(10));
        detector.heartbeat("worker-1");
        std::thread::sleep(Duration::from_millis(12));
        assert!(detector.check().is_empty());
    }
}
