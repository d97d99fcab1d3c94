//! Lifecycle orchestrator (§5): constructs every component in dependency order, starts its
//! background tasks, and tears them down in reverse on shutdown.
//!
//! Grounded on fc-router's `lifecycle.rs`: one `broadcast::Sender<()>` fans shutdown out to
//! every background task, each of which is a `tokio::select!` between its ticker and the
//! shutdown receiver.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fc_backpressure::{BackpressureConfig, BackpressureController};
use fc_cache::preloader::{Preloader, PreloaderConfig, PreloaderEvent};
use fc_cache::{service_pool, CacheConfig as MultiLevelCacheConfig, MultiLevelCache};
use fc_common::{FailureType, WarningCategory, WarningSeverity, CLEANUP_INTERVAL, HEARTBEAT_TIMEOUT};
use fc_config::AppConfig;
use fc_registry::ClientRegistry;
use fc_robustness::{
    CircuitBreakerConfig, CircuitBreakerRegistry, DegradationManager, FailureRecoveryRegistry, HotConfig, MemoryLevel, MemoryMonitor,
    MemorySampler, RecoveryAction, RecoveryStrategy, StarvationDetector, SystemLoad, WarningService, WarningServiceConfig,
};
use fc_secrets::{SecretService, SecretsConfig as SecretsBackendConfig, SecretsError};
use fc_session::SessionManager;
use fc_stats::StatsRegistry;
use fc_threadpool::ThreadManager;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::connection::{self, ConnectionHub, ConnectionManagerConfig};
use crate::db::SqliteChatRepository;
use crate::dispatch::{EngineConfig, MessageEngine};
use crate::ordering::DeliveryOrderer;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to bind listener: {0}")]
    Bind(std::io::Error),
    #[error("failed to load TLS material: {0}")]
    Tls(#[from] connection::ConnectionError),
    #[error("failed to connect to the database: {0}")]
    Database(#[from] crate::db::DbError),
    #[error("failed to initialize the cache: {0}")]
    Cache(std::io::Error),
    #[error("metrics recorder failed to install: {0}")]
    Stats(#[from] fc_stats::StatsError),
    #[error("failed to resolve a secret reference: {0}")]
    Secrets(#[from] SecretsError),
}

/// Every long-lived component, held so the orchestrator can drain and tear each down in
/// reverse construction order.
pub struct ChatServer {
    pub thread_manager: Arc<ThreadManager>,
    pub registry: Arc<ClientRegistry>,
    pub sessions: Arc<SessionManager>,
    pub cache: Arc<MultiLevelCache>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub warnings: Arc<WarningService>,
    pub backpressure: Arc<BackpressureController>,
    pub stats: Arc<StatsRegistry>,
    pub hub: Arc<ConnectionHub>,
    pub engine: Arc<MessageEngine>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    secrets: Arc<SecretService>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ChatServer {
    /// Builds every component in dependency order and starts its background tasks, but does
    /// not yet accept connections — call `serve` for that once startup logging is done.
    pub async fn start(config: &AppConfig) -> Result<Arc<Self>, LifecycleError> {
        let (shutdown_tx, _) = broadcast::channel(16);

        let stats = Arc::new(StatsRegistry::new());
        let metrics_handle = fc_stats::install_prometheus_recorder()?;
        info!("stats layer ready");

        let thread_manager = Arc::new(ThreadManager::new());
        thread_manager.log_startup();
        thread_manager.spawn_auto_resize();

        let registry = Arc::new(ClientRegistry::new());

        let sessions = Arc::new(SessionManager::with_default_ttl(Duration::from_secs(config.security.session_timeout_secs)));
        sessions.spawn_sweeper();

        let secrets = Arc::new(SecretService::new(&to_secrets_backend_config(config)).await?);
        let resolved_db_password = resolve_secret(&secrets, &config.database.password).await?;
        if !resolved_db_password.is_empty() {
            debug!("database credential resolved via secrets layer");
        }

        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let warnings = Arc::new(WarningService::new(WarningServiceConfig::default()));
        let starvation = Arc::new(StarvationDetector::default());

        let cache = MultiLevelCache::new(MultiLevelCacheConfig {
            l1: fc_cache::l1::L1Config {
                max_items: config.cache.l1.max_items as u64,
                max_size_bytes: config.cache.l1.max_size_bytes,
                strategy: parse_strategy(&config.cache.l1.strategy),
            },
            l2_root: PathBuf::from(&config.cache.l2.storage_path),
            l3_enabled: config.cache.l3.enabled,
            cleanup_interval: Duration::from_secs(config.cache.cleanup_interval_secs),
            demotion_threshold: Duration::from_secs(config.cache.demotion_threshold_secs),
        })
        .map_err(LifecycleError::Cache)?;
        spawn_cache_maintenance(cache.clone(), warnings.clone(), shutdown_tx.subscribe());

        let backpressure = Arc::new(BackpressureController::new(BackpressureConfig::default()));
        spawn_backpressure_ticker(backpressure.clone(), shutdown_tx.subscribe());

        let db_url = format!("sqlite://{}?mode=rwc", config.database.name);
        let repo = Arc::new(SqliteChatRepository::connect(&db_url).await?);

        let orderer = Arc::new(DeliveryOrderer::new(Duration::from_secs(300)));
        spawn_orderer_sweeper(orderer.clone(), shutdown_tx.subscribe());

        let hub = Arc::new(ConnectionHub::new());

        let recovery = Arc::new(FailureRecoveryRegistry::new());
        // sqlx already retries its own pool connections transparently; this registration exists
        // so database failures are counted and can still escalate to emergency, not to perform
        // a manual reconnect.
        recovery.register(
            FailureType::DatabaseFailure,
            "database",
            RecoveryAction {
                strategy: RecoveryStrategy::CircuitBreaker,
                action: Arc::new(|| false),
                max_retries: 0,
                backoff_delay: Duration::from_secs(1),
                is_async: false,
            },
        );

        let pool = service_pool(&thread_manager);
        let (preloader, preloader_events) = Preloader::new(PreloaderConfig::default());
        spawn_preloader(
            preloader,
            preloader_events,
            pool,
            cache.clone(),
            PreloaderConfig::default().adaptive_interval,
            starvation.clone(),
            shutdown_tx.subscribe(),
            shutdown_tx.subscribe(),
            shutdown_tx.subscribe(),
        );

        let memory_monitor = Arc::new(MemoryMonitor::new(ProcMemorySampler));
        let cleanup_cache = cache.clone();
        memory_monitor.register_cleanup_handler(Arc::new(move || {
            cleanup_cache.optimizer_tick();
            (0, true)
        }));
        spawn_memory_monitor(memory_monitor, warnings.clone(), shutdown_tx.subscribe());

        let degradation = Arc::new(DegradationManager::new());
        let degradation_warnings = warnings.clone();
        degradation.register_handler(
            fc_common::DegradationLevel::Heavy,
            Arc::new(move || {
                degradation_warnings.report(WarningCategory::Resource, WarningSeverity::Warn, "system load entered heavy degradation");
            }),
        );
        let degradation_warnings = warnings.clone();
        degradation.register_handler(
            fc_common::DegradationLevel::Emergency,
            Arc::new(move || {
                degradation_warnings.report(WarningCategory::Resource, WarningSeverity::Critical, "system load entered emergency degradation");
            }),
        );
        spawn_degradation_evaluator(degradation, cache.clone(), shutdown_tx.subscribe());

        spawn_starvation_checker(starvation.clone(), warnings.clone(), shutdown_tx.subscribe());

        match fc_config::ConfigLoader::new().resolved_path() {
            Some(path) => {
                let (hot_config, rx) = HotConfig::new(
                    path,
                    config.clone(),
                    |s: &str| toml::from_str::<AppConfig>(s).map_err(|e| e.to_string()),
                    |cfg: &AppConfig| {
                        if cfg.server.port == 0 {
                            Err("server.port must be nonzero".to_string())
                        } else {
                            Ok(())
                        }
                    },
                );
                spawn_hot_config(hot_config, rx, shutdown_tx.subscribe());
            }
            None => warn!("no config file found on disk; hot-reload disabled for this run"),
        }

        let engine_config = EngineConfig {
            login_signing_key: config.security.login_signing_key.clone().into_bytes(),
            group_key_salt: config.security.group_key_salt.clone(),
        };
        let engine = Arc::new(MessageEngine::new(
            registry.clone(),
            sessions.clone(),
            repo,
            backpressure.clone(),
            breakers.clone(),
            recovery,
            stats.clone(),
            orderer,
            hub.clone(),
            engine_config,
        ));
        connection::log_presence_events(&engine);

        Ok(Arc::new(Self {
            thread_manager,
            registry,
            sessions,
            cache,
            breakers,
            warnings,
            backpressure,
            stats,
            hub,
            engine,
            metrics_handle,
            secrets,
            shutdown_tx,
        }))
    }

    /// Binds the listener, optionally wraps it in TLS, and runs the accept loop plus idle
    /// sweeper until `shutdown` is called from another task.
    pub async fn serve(self: &Arc<Self>, config: &AppConfig) -> Result<(), LifecycleError> {
        let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
            .await
            .map_err(LifecycleError::Bind)?;
        info!(host = %config.server.host, port = config.server.port, "listening");

        let tls = if config.security.ssl_enabled {
            let key_password = resolve_secret(&self.secrets, &config.security.key_password).await?;
            Some(connection::load_tls_acceptor(
                std::path::Path::new(&config.security.cert_file),
                std::path::Path::new(&config.security.key_file),
                if key_password.is_empty() { None } else { Some(key_password.as_str()) },
            )?)
        } else {
            warn!("SSL disabled; accepting plaintext connections (development profiles only)");
            None
        };

        let conn_config = Arc::new(ConnectionManagerConfig { read_idle_timeout: HEARTBEAT_TIMEOUT, sweep_interval: CLEANUP_INTERVAL });
        tokio::spawn(connection::spawn_idle_sweeper(self.hub.clone(), self.registry.clone(), conn_config.clone()));

        connection::run_accept_loop(
            listener,
            tls,
            self.engine.clone(),
            self.hub.clone(),
            self.registry.clone(),
            self.stats.clone(),
            conn_config,
            self.shutdown_tx.subscribe(),
        )
        .await;
        Ok(())
    }

    /// Signals every background task to stop, waits up to `grace` for in-flight work to
    /// drain, then returns. Teardown order is the reverse of `start`: stop accepting first
    /// (handled by the caller dropping out of `serve`), then sweepers/tickers via the
    /// shutdown broadcast, then whatever the cache needs flushed.
    pub async fn shutdown(&self, grace: Duration) {
        info!("lifecycle shutdown initiated");
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(grace.min(Duration::from_secs(30))).await;
        self.cache.maintenance_tick();
        info!("lifecycle shutdown complete");
    }
}

fn parse_strategy(name: &str) -> fc_common::EvictionStrategy {
    match name {
        "lfu" => fc_common::EvictionStrategy::Lfu,
        "random" => fc_common::EvictionStrategy::Random,
        "fifo" => fc_common::EvictionStrategy::Fifo,
        "ttl" => fc_common::EvictionStrategy::Ttl,
        _ => fc_common::EvictionStrategy::Lru,
    }
}

/// Maps the flat, TOML-friendly secrets config (`fc_config::SecretsConfig`) onto the backend's
/// own richer shape. Empty strings mean "unset" in the flat config.
fn to_secrets_backend_config(config: &AppConfig) -> SecretsBackendConfig {
    fn non_empty(s: &str) -> Option<String> {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    }
    SecretsBackendConfig {
        provider: config.secrets.provider.clone(),
        encryption_key: non_empty(&config.secrets.encryption_key),
        data_dir: PathBuf::from(&config.data_dir).join("secrets"),
        aws_region: non_empty(&config.secrets.aws_region),
        aws_prefix: Some("/flowcatalyst/".to_string()),
        aws_sm_enabled: None,
        aws_ps_enabled: None,
        vault_addr: non_empty(&config.secrets.vault_addr),
        vault_path: non_empty(&config.secrets.vault_path),
        vault_token: None,
        vault_enabled: None,
    }
}

/// Resolves `value` through the secrets backend if it looks like a secret reference
/// (`vault://`, `aws-sm://`, ...); otherwise passes it through unchanged as a literal.
async fn resolve_secret(secrets: &SecretService, value: &str) -> Result<String, LifecycleError> {
    if value.is_empty() {
        return Ok(String::new());
    }
    if secrets.is_valid_format(value) {
        Ok(secrets.resolve(value).await?)
    } else {
        Ok(value.to_string())
    }
}

/// Samples this process's resident set size from `/proc/self/status` against an assumed
/// memory budget. No per-deployment memory-limit setting exists yet, so the budget is a fixed
/// approximation rather than a configured cgroup/container limit.
struct ProcMemorySampler;

const ASSUMED_MEMORY_BUDGET_BYTES: u64 = 1024 * 1024 * 1024;

impl ProcMemorySampler {
    fn rss_bytes() -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        status
            .lines()
            .find_map(|line| line.strip_prefix("VmRSS:"))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    }
}

impl MemorySampler for ProcMemorySampler {
    fn sample_percent(&self) -> u8 {
        match Self::rss_bytes() {
            Some(rss) => (rss.saturating_mul(100) / ASSUMED_MEMORY_BUDGET_BYTES).min(100) as u8,
            None => 0,
        }
    }
}

fn spawn_cache_maintenance(cache: Arc<MultiLevelCache>, warnings: Arc<WarningService>, mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(fc_cache::DEFAULT_CLEANUP_INTERVAL);
        let mut alerting = false;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cache.maintenance_tick();
                    cache.optimizer_tick();
                    match cache.health_alert() {
                        Some((hit_rate, avg_latency_us)) => {
                            if !alerting {
                                alerting = true;
                                warnings.report(
                                    WarningCategory::Resource,
                                    WarningSeverity::Warn,
                                    format!("cache health degraded: hit_rate={hit_rate:.2} avg_latency_us={avg_latency_us:.0}"),
                                );
                            }
                        }
                        None => alerting = false,
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("cache maintenance task shutting down");
                    break;
                }
            }
        }
    });
}

fn spawn_backpressure_ticker(controller: Arc<BackpressureController>, mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => controller.tick(),
                _ = shutdown_rx.recv() => {
                    info!("backpressure ticker shutting down");
                    break;
                }
            }
        }
    });
}

fn spawn_orderer_sweeper(orderer: Arc<DeliveryOrderer>, mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = ticker.tick() => orderer.sweep_idle(),
                _ = shutdown_rx.recv() => {
                    info!("delivery orderer sweeper shutting down");
                    break;
                }
            }
        }
    });
}

/// Starts the Preloader's three long-lived tasks: the 100 ms worker tick, the adaptive
/// pattern-generator run, and an event log draining `PreloaderEvent`s. The loader reads
/// straight from L2/L3 (§4.H warming from what's already on a backing tier) and the generator
/// asks the access tracker's LRU-K predictor for candidate keys (§4.G `predict_next`).
fn spawn_preloader(
    preloader: Arc<Preloader>,
    events_rx: mpsc::UnboundedReceiver<PreloaderEvent>,
    pool: Arc<fc_threadpool::ProcessPool>,
    cache: Arc<MultiLevelCache>,
    adaptive_interval: Duration,
    starvation: Arc<StarvationDetector>,
    mut tick_shutdown_rx: broadcast::Receiver<()>,
    mut generator_shutdown_rx: broadcast::Receiver<()>,
    mut events_shutdown_rx: broadcast::Receiver<()>,
) {
    starvation.register("preloader");

    let cache_set: Arc<dyn Fn(String, serde_json::Value) + Send + Sync> = {
        let cache = cache.clone();
        Arc::new(move |key, value| cache.preload_set(key, value))
    };
    let loader: fc_cache::preloader::Loader = {
        let cache = cache.clone();
        Arc::new(move |key: String| {
            let cache = cache.clone();
            Box::pin(async move { cache.peek_backing(&key) }) as fc_cache::preloader::BoxFuture<Option<serde_json::Value>>
        })
    };
    preloader.register_generator("hot-keys", {
        let cache = cache.clone();
        Arc::new(move || cache.tracker().predict_next(20))
    });

    let tick_preloader = preloader.clone();
    let tick_starvation = starvation.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tick_preloader.tick(&pool, cache_set.clone());
                    tick_starvation.heartbeat("preloader");
                }
                _ = tick_shutdown_rx.recv() => {
                    info!("preloader tick task shutting down");
                    break;
                }
            }
        }
    });

    let gen_preloader = preloader.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(adaptive_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => gen_preloader.run_adaptive_generators(loader.clone()),
                _ = generator_shutdown_rx.recv() => {
                    info!("preloader generator task shutting down");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut events_rx = events_rx;
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(PreloaderEvent::TaskSucceeded { id, key }) => debug!(%id, %key, "preload task succeeded"),
                        Some(PreloaderEvent::TaskFailed { id, key }) => debug!(%id, %key, "preload task failed"),
                        Some(PreloaderEvent::RateLimitExceeded) => warn!("preloader rate limit exceeded"),
                        None => break,
                    }
                }
                _ = events_shutdown_rx.recv() => {
                    info!("preloader event log shutting down");
                    break;
                }
            }
        }
    });
}

fn spawn_memory_monitor(monitor: Arc<MemoryMonitor<ProcMemorySampler>>, warnings: Arc<WarningService>, mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(level) = monitor.tick() {
                        if level > MemoryLevel::Normal {
                            warnings.report(WarningCategory::Resource, WarningSeverity::Warn, format!("memory usage crossed into {level:?}"));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("memory monitor task shutting down");
                    break;
                }
            }
        }
    });
}

fn spawn_degradation_evaluator(manager: Arc<DegradationManager>, cache: Arc<MultiLevelCache>, mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let load = SystemLoad {
                        cpu_pct: 0,
                        memory_pct: ProcMemorySampler.sample_percent(),
                        disk_io_pct: 0,
                        net_io_pct: 0,
                        avg_response_time_ms: (cache.metrics().average_latency_us / 1000.0) as u32,
                    };
                    manager.evaluate(&load);
                }
                _ = shutdown_rx.recv() => {
                    info!("degradation evaluator shutting down");
                    break;
                }
            }
        }
    });
}

fn spawn_starvation_checker(detector: Arc<StarvationDetector>, warnings: Arc<WarningService>, mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for name in detector.check() {
                        warnings.report(WarningCategory::PoolHealth, WarningSeverity::Error, format!("background task '{name}' missed its heartbeat"));
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("starvation checker shutting down");
                    break;
                }
            }
        }
    });
}

fn spawn_hot_config(mut hot_config: HotConfig<AppConfig>, rx: tokio::sync::watch::Receiver<AppConfig>, mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if hot_config.poll() {
                        info!(port = rx.borrow().server.port, "configuration file reloaded");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("hot config watcher shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strategy_recognizes_each_named_variant() {
        assert_eq!(parse_strategy("lfu"), fc_common::EvictionStrategy::Lfu);
        assert_eq!(parse_strategy("random"), fc_common::EvictionStrategy::Random);
        assert_eq!(parse_strategy("fifo"), fc_common::EvictionStrategy::Fifo);
        assert_eq!(parse_strategy("ttl"), fc_common::EvictionStrategy::Ttl);
    }

    #[test]
    fn parse_strategy_defaults_to_lru() {
        assert_eq!(parse_strategy("lru"), fc_common::EvictionStrategy::Lru);
        assert_eq!(parse_strategy("unrecognized"), fc_common::EvictionStrategy::Lru);
    }

    #[test]
    fn memory_sampler_never_panics_without_proc_access() {
        let _ = ProcMemorySampler.sample_percent();
    }
}
