use crate::BoxedTask;
use dashmap::DashSet;
use fc_common::TaskPriority;
use futures::FutureExt;
use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("pool queue is over its configured threshold")]
    PoolOverloaded,
    #[error("submission rejected by rate limiter")]
    RateLimited,
}

#[derive(Debug, Clone)]
pub struct ProcessPoolConfig {
    pub name: String,
    pub min: u32,
    pub max: u32,
    pub hard_max: u32,
    pub auto_resize: bool,
    pub load_threshold: f64,
    pub rate_limit_per_minute: Option<u32>,
}

struct QueuedTask {
    id: u64,
    priority: TaskPriority,
    seq: u64,
    task: BoxedTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedTask {}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: higher priority first, and within a priority, the
        // earlier-submitted (lower seq) task first — so we invert the seq comparison.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A handle to a previously-submitted task. `cancel()` is honored only if the task has not
/// yet been dequeued; a task already running cannot be interrupted mid-flight.
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    cancelled: Arc<DashSet<u64>>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancelled.insert(self.id);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStatsSnapshot {
    pub min: u32,
    pub max: u32,
    pub active: u32,
    pub queued: u32,
    pub failed_tasks: u64,
    pub completed_tasks: u64,
}

/// One categorized worker pool (§4.A). Queue is priority-ordered; within a priority, FIFO.
pub struct ProcessPool {
    config: Mutex<ProcessPoolConfig>,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    notify: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    current_max: AtomicU32,
    next_seq: AtomicU64,
    next_id: AtomicU64,
    cancelled: Arc<DashSet<u64>>,
    completed_tasks: AtomicU64,
    failed_tasks: AtomicU64,
    overload_threshold: u32,
    rate_limiter: Option<Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
}

pub type PoolHandle = Arc<ProcessPool>;

impl ProcessPool {
    pub fn new(config: ProcessPoolConfig) -> Self {
        let max = config.max;
        let rate_limiter = config.rate_limit_per_minute.map(|n| {
            let quota = Quota::per_minute(std::num::NonZeroU32::new(n).unwrap_or(nonzero!(1u32)));
            Arc::new(RateLimiter::direct(quota))
        });
        let pool = Self {
            semaphore: Arc::new(Semaphore::new(max as usize)),
            current_max: AtomicU32::new(max),
            queue: Mutex::new(BinaryHeap::new()),
            notify: Arc::new(Notify::new()),
            next_seq: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            cancelled: Arc::new(DashSet::new()),
            completed_tasks: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            overload_threshold: 1000,
            rate_limiter,
            config: Mutex::new(config),
        };
        pool
    }

    /// Submits a task at the given priority. Returns a handle usable for cancellation before
    /// the task is dequeued.
    pub fn submit<F>(self: &Arc<Self>, fut: F, priority: TaskPriority) -> Result<TaskHandle, SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(limiter) = &self.rate_limiter {
            if limiter.check().is_err() {
                return Err(SubmitError::RateLimited);
            }
        }

        {
            let queue = self.queue.lock();
            if queue.len() as u32 > self.overload_threshold {
                warn!(pool = %self.name(), "pool overloaded, rejecting submission");
                return Err(SubmitError::PoolOverloaded);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push(QueuedTask {
            id,
            priority,
            seq,
            task: Box::pin(fut),
        });
        self.notify.notify_one();
        self.spawn_dispatch_if_idle();

        Ok(TaskHandle {
            id,
            cancelled: self.cancelled.clone(),
        })
    }

    /// Pulls the next runnable task and drives it to completion on its own tokio task,
    /// holding a semaphore permit for the duration so the pool never exceeds `current_max`
    /// concurrent tasks.
    fn spawn_dispatch_if_idle(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let queued = { this.queue.lock().is_empty() };
                if queued {
                    return;
                }
                let permit = match this.semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => return, // at capacity; the task that releases a permit will re-dispatch
                };
                let next = {
                    let mut queue = this.queue.lock();
                    queue.pop()
                };
                let Some(queued_task) = next else {
                    drop(permit);
                    return;
                };
                if this.cancelled.remove(&queued_task.id).is_some() {
                    drop(permit);
                    continue;
                }
                let pool_for_task = this.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = AssertUnwindSafe(queued_task.task).catch_unwind().await;
                    match result {
                        Ok(()) => {
                            pool_for_task.completed_tasks.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            pool_for_task.failed_tasks.fetch_add(1, Ordering::Relaxed);
                            debug!("pool task panicked, counted as failed");
                        }
                    }
                    // a permit just freed up; give the dispatcher another chance to drain.
                    pool_for_task.spawn_dispatch_if_idle();
                });
            }
        });
    }

    pub fn name(&self) -> String {
        self.config.lock().name.clone()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        let config = self.config.lock();
        let max = self.current_max.load(Ordering::Relaxed);
        let active = max.saturating_sub(self.semaphore.available_permits() as u32);
        PoolStatsSnapshot {
            min: config.min,
            max,
            active,
            queued: self.queue.lock().len() as u32,
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
        }
    }

    /// §4.A auto-resize rule, evaluated every 5s by `ThreadManager::spawn_auto_resize`.
    pub fn auto_resize_tick(&self) {
        let (auto_resize, load_threshold, min, hard_max) = {
            let c = self.config.lock();
            (c.auto_resize, c.load_threshold, c.min, c.hard_max)
        };
        if !auto_resize {
            return;
        }
        let stats = self.stats();
        if stats.max == 0 {
            return;
        }
        let load = stats.active as f64 / stats.max as f64;

        if load > load_threshold && stats.queued > 0 && stats.max < hard_max {
            let grow_by = 2.min(hard_max - stats.max);
            self.semaphore.add_permits(grow_by as usize);
            self.current_max.fetch_add(grow_by, Ordering::Relaxed);
            debug!(pool = %self.name(), new_max = stats.max + grow_by, "auto-resize: grew pool");
        } else if load < 0.3 && stats.max > min {
            if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                permit.forget();
                self.current_max.fetch_sub(1, Ordering::Relaxed);
                debug!(pool = %self.name(), new_max = stats.max - 1, "auto-resize: shrank pool");
            }
        }
    }
}
