//! Failure-recovery registry (§4.I): maps `(FailureType, component)` to a `RecoveryAction`,
//! executed synchronously or posted to a pool depending on `is_async`; severity >= 8 escalates
//! the system into Emergency mode via the returned `FailureOutcome`.

use fc_common::{FailureInfo, FailureType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

pub const EMERGENCY_SEVERITY_THRESHOLD: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Restart,
    Fallback,
    CircuitBreaker,
    RetryWithBackoff,
    GradualRecovery,
    ManualIntervention,
}

pub type RecoveryFn = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RecoveryAction {
    pub strategy: RecoveryStrategy,
    pub action: RecoveryFn,
    pub max_retries: u32,
    pub backoff_delay: Duration,
    pub is_async: bool,
}

#[derive(Debug, Clone)]
pub struct FailureOutcome {
    pub recovered: bool,
    pub emergency: bool,
}

#[derive(Default)]
struct Counters {
    attempts: u64,
    successes: u64,
}

pub struct FailureRecoveryRegistry {
    actions: RwLock<HashMap<(FailureType, String), RecoveryAction>>,
    counters: RwLock<HashMap<(FailureType, String), Counters>>,
    emergency: std::sync::atomic::AtomicBool,
}

impl FailureRecoveryRegistry {
    pub fn new() -> Self {
        Self { actions: RwLock::new(HashMap::new()), counters: RwLock::new(HashMap::new()), emergency: std::sync::atomic::AtomicBool::new(false) }
    }

    pub fn register(&self, failure_type: FailureType, component: impl Into<String>, action: RecoveryAction) {
        self.actions.write().insert((failure_type, component.into()), action);
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::Relaxed)
    }

    /// Executes the matching recovery action (synchronously, ignoring `is_async` here — the
    /// async dispatch onto a pool is the caller's responsibility since this crate has no pool
    /// dependency) and records statistics.
    pub fn report_failure(&self, info: &FailureInfo) -> FailureOutcome {
        let key = (info.failure_type, info.component.clone());
        let action = self.actions.read().get(&key).cloned();

        let recovered = match &action {
            Some(action) => {
                let mut attempt = 0;
                let mut ok = false;
                while attempt <= action.max_retries {
                    if (action.action)() {
                        ok = true;
                        break;
                    }
                    attempt += 1;
                }
                ok
            }
            None => {
                warn!(component = %info.component, ?info.failure_type, "no recovery action registered");
                false
            }
        };

        {
            let mut counters = self.counters.write();
            let entry = counters.entry(key).or_default();
            entry.attempts += 1;
            if recovered {
                entry.successes += 1;
            }
        }

        if info.severity >= EMERGENCY_SEVERITY_THRESHOLD {
            self.emergency.store(true, Ordering::Relaxed);
            error!(component = %info.component, severity = info.severity, "failure severity triggered emergency mode");
        }

        FailureOutcome { recovered, emergency: self.is_emergency() }
    }

    pub fn success_rate(&self, failure_type: FailureType, component: &str) -> Option<f64> {
        let counters = self.counters.read();
        counters.get(&(failure_type, component.to_string())).map(|c| {
            if c.attempts == 0 {
                0.0
            } else {
                c.successes as f64 / c.attempts as f64
            }
        })
    }

    pub fn clear_emergency(&self) {
        self.emergency.store(false, Ordering::Relaxed);
    }
}

impl Default for FailureRecoveryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn failure(severity: u8, failure_type: FailureType, component: &str) -> FailureInfo {
        FailureInfo {
            failure_type,
            component: component.to_string(),
            description: "boom".into(),
            timestamp: chrono::Utc::now(),
            severity,
            context: Map::new(),
        }
    }

    #[test]
    fn matching_action_is_invoked_and_counted() {
        let registry = FailureRecoveryRegistry::new();
        registry.register(
            FailureType::DatabaseFailure,
            "db",
            RecoveryAction {
                strategy: RecoveryStrategy::Restart,
                action: Arc::new(|| true),
                max_retries: 0,
                backoff_delay: Duration::from_millis(0),
                is_async: false,
            },
        );
        let outcome = registry.report_failure(&failure(3, FailureType::DatabaseFailure, "db"));
        assert!(outcome.recovered);
        assert!(!outcome.emergency);
        assert_eq!(registry.success_rate(FailureType::DatabaseFailure, "db"), Some(1.0));
    }

    #[test]
    fn high_severity_triggers_emergency() {
        let registry = FailureRecoveryRegistry::new();
        let outcome = registry.report_failure(&failure(9, FailureType::ComponentCrash, "core"));
        assert!(outcome.emergency);
        assert!(registry.is_emergency());
    }
}
