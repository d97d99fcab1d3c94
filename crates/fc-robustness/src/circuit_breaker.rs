//! Per-dependency circuit breaker registry (§4.I). `Closed -> Open -> HalfOpen -> Closed`,
//! tripped by consecutive failures/successes rather than a windowed failure rate.

use dashmap::DashMap;
use fc_common::{CircuitBreakerState, CircuitBreakerStats};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u64,
    pub success_threshold: u64,
    pub timeout: Duration,
    pub half_open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_timeout: Duration::from_secs(10),
        }
    }
}

struct Breaker {
    name: String,
    state: RwLock<CircuitBreakerState>,
    consecutive_failures: AtomicU64,
    consecutive_successes: AtomicU64,
    opened_at: RwLock<Option<Instant>>,
    probe_in_flight: AtomicBool,
    config: CircuitBreakerConfig,
}

impl Breaker {
    fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            state: RwLock::new(CircuitBreakerState::Closed),
            consecutive_failures: AtomicU64::new(0),
            consecutive_successes: AtomicU64::new(0),
            opened_at: RwLock::new(None),
            probe_in_flight: AtomicBool::new(false),
            config,
        }
    }

    /// Before any protected call: fail fast if Open; allow exactly one probe if HalfOpen.
    fn allow_request(&self) -> bool {
        let state = *self.state.read();
        match state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => {
                let elapsed = self.opened_at.read().map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.timeout {
                    *self.state.write() = CircuitBreakerState::HalfOpen;
                    self.probe_in_flight.store(false, Ordering::SeqCst);
                    self.try_take_probe_slot()
                } else {
                    false
                }
            }
            CircuitBreakerState::HalfOpen => self.try_take_probe_slot(),
        }
    }

    fn try_take_probe_slot(&self) -> bool {
        self.probe_in_flight.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    fn record_success(&self) {
        self.probe_in_flight.store(false, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if *self.state.read() == CircuitBreakerState::HalfOpen && successes >= self.config.success_threshold {
            *self.state.write() = CircuitBreakerState::Closed;
            *self.opened_at.write() = None;
        }
    }

    fn record_failure(&self) {
        self.probe_in_flight.store(false, Ordering::SeqCst);
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let state = *self.state.read();
        match state {
            CircuitBreakerState::Closed if failures >= self.config.failure_threshold => {
                self.trip();
            }
            CircuitBreakerState::HalfOpen => self.trip(),
            _ => {}
        }
    }

    fn trip(&self) {
        *self.state.write() = CircuitBreakerState::Open;
        *self.opened_at.write() = Some(Instant::now());
    }

    fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            name: self.name.clone(),
            state: *self.state.read(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            consecutive_successes: self.consecutive_successes.load(Ordering::Relaxed),
        }
    }
}

pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<Breaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { breakers: DashMap::new(), config }
    }

    fn get_or_create(&self, name: &str) -> Arc<Breaker> {
        if let Some(b) = self.breakers.get(name) {
            return b.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Breaker::new(name.to_string(), self.config.clone())))
            .clone()
    }

    pub fn allow_request(&self, dependency: &str) -> bool {
        self.get_or_create(dependency).allow_request()
    }

    pub fn record_success(&self, dependency: &str) {
        self.get_or_create(dependency).record_success();
    }

    pub fn record_failure(&self, dependency: &str) {
        self.get_or_create(dependency).record_failure();
    }

    pub fn state(&self, dependency: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(dependency).map(|b| *b.state.read())
    }

    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.iter().map(|e| e.value().stats()).collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_open_after_consecutive_failures() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
            half_open_timeout: Duration::from_millis(50),
        });
        registry.record_failure("db");
        registry.record_failure("db");
        assert!(registry.allow_request("db"));
        registry.record_failure("db");
        assert_eq!(registry.state("db"), Some(CircuitBreakerState::Open));
        assert!(!registry.allow_request("db"));
    }

    #[test]
    fn half_open_allows_exactly_one_probe() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout: Duration::from_millis(10),
            half_open_timeout: Duration::from_millis(10),
        });
        registry.record_failure("db");
        std::thread::sleep(Duration::from_millis(20));
        assert!(registry.allow_request("db"));
        assert!(!registry.allow_request("db"));
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout: Duration::from_millis(10),
            half_open_timeout: Duration::from_millis(10),
        });
        registry.record_failure("db");
        std::thread::sleep(Duration::from_millis(20));
        assert!(registry.allow_request("db"));
        registry.record_success("db");
        assert_eq!(registry.state("db"), Some(CircuitBreakerState::Closed));
    }
}
