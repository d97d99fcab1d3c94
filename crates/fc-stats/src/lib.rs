//! Stats & Metrics (§4.K): atomic, lock-free counters with a single read-and-copy snapshot
//! routine, plus a process-wide Prometheus-compatible registry so external monitoring never
//! needs to poll the in-process API.
//!
//! Adapted from fc-router's `metrics.rs`/`router_metrics.rs` split: `recorders` mirrors that
//! module's thin per-counter wrappers over the `metrics` macros; `StatsRegistry` is new,
//! generalized from per-pool sampling to the cross-cutting counter families this system needs.

pub mod recorders;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to install prometheus recorder: {0}")]
    Install(String),
}

/// Installs the global `metrics` recorder and returns a handle whose `render()` produces the
/// scrape-endpoint body. Call once at startup.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, StatsError> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| StatsError::Install(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Cross-cutting atomic counters not owned by any single component (message throughput,
/// connection churn). Per-component counters (pool stats, cache stats, circuit breaker state)
/// live alongside their owning component and are mirrored via `recorders`.
#[derive(Default)]
pub struct StatsRegistry {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    connections_accepted: AtomicU64,
    connections_closed: AtomicU64,
    auth_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub auth_failures: u64,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        recorders::messages_processed("send", true);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A single read-and-copy of every atomic; consistent per-snapshot arithmetic is
    /// guaranteed, cross-snapshot atomicity between counters is not (§4.K).
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let stats = StatsRegistry::new();
        stats.record_message_sent();
        stats.record_message_sent();
        stats.record_connection_accepted();
        let snap = stats.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.connections_accepted, 1);
        assert_eq!(snap.connections_closed, 0);
    }
}
