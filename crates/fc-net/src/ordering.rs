//! Per-user delivery ordering (§5: "per-user delivery order = persistence order").
//!
//! Grounded on fc-outbox's `group_distributor.rs`/`message_group_processor.rs`: each group
//! key gets its own FIFO queue drained by a single dedicated worker, so messages destined for
//! the same user are always persisted and delivered in submission order even though many
//! connections submit concurrently. Idle group workers are reaped after a timeout rather than
//! kept forever, since the key space here (one group per active user) is effectively
//! unbounded over a server's lifetime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

pub type OrderedJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct GroupWorker {
    tx: mpsc::Sender<OrderedJob>,
    last_activity: Instant,
}

/// Routes jobs to a per-group sequential worker keyed by an opaque group key (the 16-byte
/// value from `crypto::derive_group_key`, hex-encoded for use as a map key).
pub struct DeliveryOrderer {
    groups: Arc<DashMap<String, GroupWorker>>,
    idle_timeout: Duration,
}

impl DeliveryOrderer {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { groups: Arc::new(DashMap::new()), idle_timeout }
    }

    /// Enqueues `job` onto the named group's FIFO queue, spawning a worker for the group on
    /// first use. Jobs within a group run strictly one at a time, in submission order.
    pub fn submit(&self, group_key: &str, job: OrderedJob) {
        if let Some(mut entry) = self.groups.get_mut(group_key) {
            entry.last_activity = Instant::now();
            if entry.tx.try_send(job).is_ok() {
                return;
            }
        }
        let (tx, rx) = mpsc::channel::<OrderedJob>(256);
        let first_job_sent = tx.try_send(job).is_ok();
        self.groups.insert(
            group_key.to_string(),
            GroupWorker { tx, last_activity: Instant::now() },
        );
        spawn_worker(group_key.to_string(), rx);
        if !first_job_sent {
            debug!(group = group_key, "delivery orderer dropped a job on worker creation race");
        }
    }

    /// Removes group workers that have been idle past `idle_timeout` (mirrors
    /// `group_distributor.rs`'s `group_idle_timeout_secs` sweep).
    pub fn sweep_idle(&self) {
        let cutoff = self.idle_timeout;
        self.groups.retain(|_, worker| worker.last_activity.elapsed() < cutoff);
    }

    pub fn active_groups(&self) -> usize {
        self.groups.len()
    }
}

fn spawn_worker(group_key: String, mut rx: mpsc::Receiver<OrderedJob>) {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            job.await;
        }
        debug!(group = %group_key, "delivery orderer worker drained and exiting");
    });
}

/// Serializes arbitrary async closures behind a single mutex when a full per-group worker
/// is overkill (used by tests and by callers that already hold group-level exclusivity).
pub async fn run_in_order<F, Fut>(lock: &Mutex<()>, f: F) -> Fut::Output
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    let _guard = lock.lock().await;
    f().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn jobs_in_the_same_group_run_in_submission_order() {
        let orderer = DeliveryOrderer::new(Duration::from_secs(60));
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            orderer.submit(
                "group-a",
                Box::pin(async move {
                    order.lock().await.push(i);
                }),
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn different_groups_get_independent_workers() {
        let orderer = DeliveryOrderer::new(Duration::from_secs(60));
        let counter = Arc::new(AtomicU32::new(0));
        for group in ["a", "b", "c"] {
            let counter = counter.clone();
            orderer.submit(
                group,
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(orderer.active_groups(), 3);
    }

    #[tokio::test]
    async fn sweep_idle_drops_stale_workers() {
        let orderer = DeliveryOrderer::new(Duration::from_millis(1));
        orderer.submit("a", Box::pin(async {}));
        tokio::time::sleep(Duration::from_millis(10)).await;
        orderer.sweep_idle();
        assert_eq!(orderer.active_groups(), 0);
    }
}
