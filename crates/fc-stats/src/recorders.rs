//! Thin wrappers over the `metrics` macros (§4.K), one function per counter family, mirroring
//! every in-process atomic into the process-wide registry so the Prometheus endpoint never
//! needs polling the in-process snapshot API.

use fc_common::{BackpressureLevel, CircuitBreakerState};
use metrics::{counter, gauge};

pub fn pool_queue_depth(pool: &str, depth: u32) {
    gauge!("fc_pool_queue_depth", "pool" => pool.to_string()).set(depth as f64);
}

pub fn pool_active_tasks(pool: &str, active: u32) {
    gauge!("fc_pool_active_tasks", "pool" => pool.to_string()).set(active as f64);
}

pub fn pool_task_completed(pool: &str) {
    counter!("fc_pool_tasks_completed_total", "pool" => pool.to_string()).increment(1);
}

pub fn pool_task_failed(pool: &str) {
    counter!("fc_pool_tasks_failed_total", "pool" => pool.to_string()).increment(1);
}

pub fn cache_hit(level: &str) {
    counter!("fc_cache_hits_total", "level" => level.to_string()).increment(1);
}

pub fn cache_miss(level: &str) {
    counter!("fc_cache_misses_total", "level" => level.to_string()).increment(1);
}

pub fn cache_eviction(level: &str) {
    counter!("fc_cache_evictions_total", "level" => level.to_string()).increment(1);
}

pub fn backpressure_level(level: BackpressureLevel) {
    gauge!("fc_backpressure_level").set(level as u8 as f64);
}

pub fn circuit_breaker_state(name: &str, state: CircuitBreakerState) {
    gauge!("fc_circuit_breaker_state", "dependency" => name.to_string()).set(state as u8 as f64);
}

pub fn connections_active(count: u64) {
    gauge!("fc_connections_active").set(count as f64);
}

pub fn messages_processed(message_type: &str, success: bool) {
    counter!(
        "fc_messages_processed_total",
        "message_type" => message_type.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}
