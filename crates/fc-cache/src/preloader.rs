//! Preloader (§4.H): four priority bands plus a scheduled heap, a 100 ms worker tick, a sliding
//! rate limiter, retry-with-backoff, and adaptive pattern generators.

use fc_common::{PreloadTaskMeta, PreloadTaskType, TaskPriority};
use fc_threadpool::ProcessPool;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type Loader = Arc<dyn Fn(String) -> BoxFuture<Option<serde_json::Value>> + Send + Sync>;
pub type Condition = Arc<dyn Fn() -> bool + Send + Sync>;
pub type PatternGenerator = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

pub struct PreloadTask {
    pub meta: PreloadTaskMeta,
    pub loader: Loader,
    pub condition: Option<Condition>,
    pub category: Option<String>,
}

#[derive(Debug, Clone)]
pub enum PreloaderEvent {
    RateLimitExceeded,
    TaskFailed { id: String, key: String },
    TaskSucceeded { id: String, key: String },
}

struct ScheduledEntry {
    at: Instant,
    task: PreloadTask,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl Eq for ScheduledEntry {}
impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at)
    }
}

pub struct PreloaderConfig {
    pub max_tasks_per_second: u32,
    pub rate_limit_window: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub adaptive_interval: Duration,
}

impl Default for PreloaderConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_second: 50,
            rate_limit_window: Duration::from_secs(1),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            adaptive_interval: Duration::from_secs(60),
        }
    }
}

struct Bands {
    critical: VecDeque<PreloadTask>,
    high: VecDeque<PreloadTask>,
    normal: VecDeque<PreloadTask>,
    low: VecDeque<PreloadTask>,
}

impl Bands {
    fn new() -> Self {
        Self { critical: VecDeque::new(), high: VecDeque::new(), normal: VecDeque::new(), low: VecDeque::new() }
    }

    fn push(&mut self, task: PreloadTask) {
        match task.meta.priority {
            TaskPriority::Critical => self.critical.push_back(task),
            TaskPriority::High => self.high.push_back(task),
            TaskPriority::Normal => self.normal.push_back(task),
            TaskPriority::Low => self.low.push_back(task),
        }
    }

    fn pop(&mut self) -> Option<PreloadTask> {
        self.critical
            .pop_front()
            .or_else(|| self.high.pop_front())
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn len(&self) -> usize {
        self.critical.len() + self.high.len() + self.normal.len() + self.low.len()
    }
}

pub struct Preloader {
    bands: Mutex<Bands>,
    scheduled: Mutex<BinaryHeap<Reverse<ScheduledEntryKey>>>,
    scheduled_tasks: Mutex<Vec<Option<PreloadTask>>>,
    retry_queue: Mutex<VecDeque<(PreloadTask, Instant)>>,
    generators: Mutex<Vec<(String, PatternGenerator)>>,
    config: PreloaderConfig,
    rate_window_start: Mutex<Instant>,
    rate_count: AtomicU64,
    events: mpsc::UnboundedSender<PreloaderEvent>,
}

/// `scheduled_tasks[idx]` holds the task; the heap only orders `(time, idx)` pairs so
/// `PreloadTask` (which is not `Ord`) never needs to live inside the heap itself.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct ScheduledEntryKey(Instant, usize);

impl Preloader {
    pub fn new(config: PreloaderConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<PreloaderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let preloader = Arc::new(Self {
            bands: Mutex::new(Bands::new()),
            scheduled: Mutex::new(BinaryHeap::new()),
            scheduled_tasks: Mutex::new(Vec::new()),
            retry_queue: Mutex::new(VecDeque::new()),
            generators: Mutex::new(Vec::new()),
            config,
            rate_window_start: Mutex::new(Instant::now()),
            rate_count: AtomicU64::new(0),
            events: tx,
        });
        (preloader, rx)
    }

    pub fn enqueue(&self, task: PreloadTask) {
        match task.meta.task_type {
            PreloadTaskType::Scheduled if task.meta.scheduled_time.is_some() => {
                let at = task.meta.scheduled_time.unwrap();
                let mut slots = self.scheduled_tasks.lock();
                let idx = slots.len();
                slots.push(Some(task));
                self.scheduled.lock().push(Reverse(ScheduledEntryKey(at, idx)));
            }
            _ => self.bands.lock().push(task),
        }
    }

    pub fn register_generator(&self, name: impl Into<String>, generator: PatternGenerator) {
        self.generators.lock().push((name.into(), generator));
    }

    pub fn queue_len(&self) -> usize {
        self.bands.lock().len()
    }

    /// Moves every scheduled task whose time has arrived into the immediate bands.
    fn promote_ready_scheduled(&self) {
        let now = Instant::now();
        let mut heap = self.scheduled.lock();
        let mut slots = self.scheduled_tasks.lock();
        let mut ready = Vec::new();
        while let Some(Reverse(ScheduledEntryKey(at, idx))) = heap.peek() {
            if *at > now {
                break;
            }
            let idx = *idx;
            heap.pop();
            if let Some(task) = slots[idx].take() {
                ready.push(task);
            }
        }
        drop(heap);
        drop(slots);
        let mut bands = self.bands.lock();
        for task in ready {
            bands.push(task);
        }
    }

    fn promote_ready_retries(&self) {
        let now = Instant::now();
        let mut retry = self.retry_queue.lock();
        let mut ready = Vec::new();
        while let Some((_, at)) = retry.front() {
            if *at > now {
                break;
            }
            ready.push(retry.pop_front().unwrap().0);
        }
        drop(retry);
        let mut bands = self.bands.lock();
        for task in ready {
            bands.push(task);
        }
    }

    fn rate_limit_ok(&self) -> bool {
        let mut start = self.rate_window_start.lock();
        if start.elapsed() >= self.config.rate_limit_window {
            *start = Instant::now();
            self.rate_count.store(0, Ordering::Relaxed);
        }
        let count = self.rate_count.fetch_add(1, Ordering::Relaxed);
        count < self.config.max_tasks_per_second as u64
    }

    /// Runs one worker tick (§4.H steps 1-4), submitting at most one ready task to `pool`.
    pub fn tick(self: &Arc<Self>, pool: &Arc<ProcessPool>, cache_set: Arc<dyn Fn(String, serde_json::Value) + Send + Sync>) {
        self.promote_ready_scheduled();
        self.promote_ready_retries();

        let task = {
            let mut bands = self.bands.lock();
            bands.pop()
        };
        let Some(task) = task else { return };

        if let Some(condition) = &task.condition {
            if !condition() {
                self.bands.lock().push(task);
                return;
            }
        }

        if !self.rate_limit_ok() {
            let _ = self.events.send(PreloaderEvent::RateLimitExceeded);
            return;
        }

        let this = self.clone();
        let pool = pool.clone();
        let key = task.meta.key.clone();
        let id = task.meta.id.clone();
        let loader = task.loader.clone();
        let condition = task.condition.clone();
        let category = task.category.clone();
        let mut retry_meta = task.meta.clone();

        let _ = pool.submit(
            async move {
                let result = loader(key.clone()).await;
                match result {
                    Some(value) => {
                        cache_set(key.clone(), value);
                        let _ = this.events.send(PreloaderEvent::TaskSucceeded { id, key });
                    }
                    None => {
                        retry_meta.retry_count += 1;
                        let _ = this.events.send(PreloaderEvent::TaskFailed { id: id.clone(), key: key.clone() });
                        if retry_meta.retry_count <= retry_meta.max_retries {
                            warn!(%key, attempt = retry_meta.retry_count, "preload task failed, scheduling retry");
                            let retry_at = std::time::Instant::now() + this.config.retry_delay;
                            this.retry_queue.lock().push_back((
                                PreloadTask { meta: retry_meta, loader, condition, category },
                                retry_at,
                            ));
                        } else {
                            debug!(%key, "preload task exhausted retries");
                        }
                    }
                }
            },
            task.meta.priority,
        );
    }

    /// Runs all registered adaptive generators, enqueuing Low-priority `adaptive` tasks for
    /// every key they produce (§4.H adaptive generation).
    pub fn run_adaptive_generators(&self, loader: Loader) {
        let generators = self.generators.lock();
        for (name, generator) in generators.iter() {
            for key in generator() {
                let task = PreloadTask {
                    meta: PreloadTaskMeta {
                        id: uuid::Uuid::new_v4().to_string(),
                        key,
                        scheduled_time: None,
                        task_type: PreloadTaskType::Adaptive,
                        priority: TaskPriority::Low,
                        ttl: None,
                        max_retries: 0,
                        retry_count: 0,
                    },
                    loader: loader.clone(),
                    condition: None,
                    category: Some("adaptive".to_string()),
                };
                self.bands.lock().push(task);
            }
            debug!(generator = %name, "adaptive generator ran");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn loader_always_some() -> Loader {
        Arc::new(|key: String| -> BoxFuture<Option<serde_json::Value>> {
            Box::pin(async move { Some(serde_json::json!({ "key": key })) })
        })
    }

    fn meta(priority: TaskPriority) -> PreloadTaskMeta {
        PreloadTaskMeta {
            id: uuid::Uuid::new_v4().to_string(),
            key: "k".into(),
            scheduled_time: None,
            task_type: PreloadTaskType::Immediate,
            priority,
            ttl: None,
            max_retries: 3,
            retry_count: 0,
        }
    }

    #[test]
    fn higher_priority_bands_drain_first() {
        let (preloader, _rx) = Preloader::new(PreloaderConfig::default());
        preloader.enqueue(PreloadTask { meta: meta(TaskPriority::Low), loader: loader_always_some(), condition: None, category: None });
        preloader.enqueue(PreloadTask { meta: meta(TaskPriority::Critical), loader: loader_always_some(), condition: None, category: None });
        let popped = preloader.bands.lock().pop().unwrap();
        assert_eq!(popped.meta.priority, TaskPriority::Critical);
    }

    #[test]
    fn false_condition_re_enqueues_at_tail() {
        let (preloader, _rx) = Preloader::new(PreloaderConfig::default());
        let called = Arc::new(AtomicUsize::new(0));
        let called2 = called.clone();
        preloader.enqueue(PreloadTask {
            meta: meta(TaskPriority::Normal),
            loader: loader_always_some(),
            condition: Some(Arc::new(move || {
                called2.fetch_add(1, Ordering::Relaxed);
                false
            })),
            category: None,
        });
        assert_eq!(preloader.queue_len(), 1);
    }
}
