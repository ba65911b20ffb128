//! The `Shield` root object: explicit construction of every component, the
//! background tasks that keep them honest, and graceful shutdown.

use crate::anomaly::{AnomalyDetector, AnomalyFeed};
use crate::circuit_breaker::{BreakerListener, BreakerSnapshot};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::{
    CircuitBreakerConfig, EffectiveProtection, GuardConfig, OverloadConfig, PriorityConfig,
    RateLimitConfig, SyncConfig, ThrottleConfig,
};
use crate::error::ConfigError;
use crate::guard::Guard;
use crate::metrics::{MetricsCollector, MetricsSink};
use crate::overload::{HealthIndicator, OverloadController, OverloadStatus};
use crate::priority::{PriorityClassStats, PriorityManager};
use crate::rate_limit::RateLimiter;
use crate::store::{MemoryStore, Store};
use crate::sync::{DistributedSync, SyncListener};
use crate::throttle::Throttler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Builder wiring the full pipeline. Validation happens here and only here;
/// a built [`Shield`] never fails a request on configuration grounds.
pub struct ShieldBuilder {
    store: Option<Arc<dyn Store>>,
    clock: Arc<dyn Clock>,
    guard: GuardConfig,
    rate_limit: Option<RateLimitConfig>,
    throttle: Option<ThrottleConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    overload: OverloadConfig,
    priority: PriorityConfig,
    sync: SyncConfig,
    health_indicator: Option<Arc<dyn HealthIndicator>>,
    anomaly_detector: Option<Box<dyn AnomalyDetector>>,
    breaker_listeners: Vec<Arc<dyn BreakerListener>>,
    sync_listeners: Vec<Arc<dyn SyncListener>>,
    collectors: Vec<Arc<dyn MetricsCollector>>,
    metrics_export_interval: Duration,
}

impl Default for ShieldBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ShieldBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            clock: Arc::new(SystemClock),
            guard: GuardConfig { enabled: true, ..GuardConfig::default() },
            rate_limit: None,
            throttle: None,
            circuit_breaker: None,
            overload: OverloadConfig::default(),
            priority: PriorityConfig { enabled: true, ..PriorityConfig::default() },
            sync: SyncConfig::default(),
            health_indicator: None,
            anomaly_detector: None,
            breaker_listeners: Vec::new(),
            sync_listeners: Vec::new(),
            collectors: Vec::new(),
            metrics_export_interval: Duration::from_secs(15),
        }
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn guard(mut self, cfg: GuardConfig) -> Self {
        self.guard = cfg;
        self
    }

    pub fn rate_limit(mut self, cfg: RateLimitConfig) -> Self {
        self.rate_limit = Some(cfg);
        self
    }

    pub fn throttle(mut self, cfg: ThrottleConfig) -> Self {
        self.throttle = Some(cfg);
        self
    }

    pub fn circuit_breaker(mut self, cfg: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(cfg);
        self
    }

    pub fn overload(mut self, cfg: OverloadConfig) -> Self {
        self.overload = cfg;
        self
    }

    pub fn priority(mut self, cfg: PriorityConfig) -> Self {
        self.priority = cfg;
        self
    }

    pub fn sync(mut self, cfg: SyncConfig) -> Self {
        self.sync = cfg;
        self
    }

    pub fn health_indicator(mut self, indicator: Arc<dyn HealthIndicator>) -> Self {
        self.health_indicator = Some(indicator);
        self
    }

    pub fn anomaly_detector(mut self, detector: Box<dyn AnomalyDetector>) -> Self {
        self.anomaly_detector = Some(detector);
        self
    }

    pub fn breaker_listener(mut self, listener: Arc<dyn BreakerListener>) -> Self {
        self.breaker_listeners.push(listener);
        self
    }

    pub fn sync_listener(mut self, listener: Arc<dyn SyncListener>) -> Self {
        self.sync_listeners.push(listener);
        self
    }

    pub fn metrics_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn metrics_export_interval(mut self, interval: Duration) -> Self {
        self.metrics_export_interval = interval;
        self
    }

    pub fn build(self) -> Result<Shield, ConfigError> {
        if let Some(cfg) = &self.rate_limit {
            cfg.validate()?;
        }
        if let Some(cfg) = &self.throttle {
            cfg.validate()?;
        }
        if let Some(cfg) = &self.circuit_breaker {
            cfg.validate()?;
        }
        self.overload.validate()?;
        self.priority.validate()?;
        self.sync.validate()?;

        let clock = self.clock;
        let store: Arc<dyn Store> =
            self.store.unwrap_or_else(|| Arc::new(MemoryStore::with_clock(clock.clone())));
        let metrics = MetricsSink::with_clock(clock.clone());
        for collector in &self.collectors {
            metrics.register_collector(collector.clone());
        }

        let rate_limiter =
            Arc::new(RateLimiter::new(store.clone(), metrics.clone(), clock.clone()));
        let throttler = Arc::new(Throttler::new(store.clone(), metrics.clone(), clock.clone()));
        let priorities =
            Arc::new(PriorityManager::new(self.priority, metrics.clone(), clock.clone()));
        let overload =
            OverloadController::new(self.overload, metrics.clone(), clock.clone());
        {
            let priorities = priorities.clone();
            overload.set_fairness_source(Arc::new(move || priorities.starved_class()));
        }
        let breakers = CircuitBreakerRegistry::new(
            self.circuit_breaker.clone().unwrap_or_default(),
            self.breaker_listeners,
            metrics.clone(),
            clock.clone(),
        );

        let global = EffectiveProtection {
            bypass: false,
            priority: None,
            rate_limit: self.rate_limit,
            throttle: self.throttle,
            circuit_breaker: self.circuit_breaker,
        };
        let guard = Arc::new(Guard::new(
            self.guard,
            global,
            rate_limiter.clone(),
            throttler.clone(),
            priorities.clone(),
            overload.clone(),
            breakers.clone(),
            metrics.clone(),
            clock.clone(),
        ));

        let sync = self.sync.enabled.then(|| {
            let sync = Arc::new(DistributedSync::new(
                self.sync.clone(),
                store.clone(),
                metrics.clone(),
                clock.clone(),
            ));
            for listener in &self.sync_listeners {
                sync.add_listener(listener.clone());
            }
            sync
        });

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Shield {
            guard,
            store,
            metrics,
            throttler,
            priorities,
            overload,
            breakers,
            sync,
            health_indicator: self.health_indicator,
            anomaly_detector: Mutex::new(self.anomaly_detector),
            metrics_export_interval: self.metrics_export_interval,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// Owns every component plus the background tasks. One per process, shared
/// via [`Shield::guard`] handles.
pub struct Shield {
    guard: Arc<Guard>,
    store: Arc<dyn Store>,
    metrics: MetricsSink,
    throttler: Arc<Throttler>,
    priorities: Arc<PriorityManager>,
    overload: OverloadController,
    breakers: CircuitBreakerRegistry,
    sync: Option<Arc<DistributedSync>>,
    health_indicator: Option<Arc<dyn HealthIndicator>>,
    anomaly_detector: Mutex<Option<Box<dyn AnomalyDetector>>>,
    metrics_export_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Shield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shield")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("sync", &self.sync.as_ref().map(|s| s.node_id().to_string()))
            .finish()
    }
}

impl Shield {
    pub fn builder() -> ShieldBuilder {
        ShieldBuilder::new()
    }

    pub fn guard(&self) -> Arc<Guard> {
        self.guard.clone()
    }

    pub fn metrics(&self) -> MetricsSink {
        self.metrics.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn sync(&self) -> Option<Arc<DistributedSync>> {
        self.sync.clone()
    }

    pub fn overload_status(&self) -> OverloadStatus {
        self.overload.status()
    }

    pub fn priority_stats(&self) -> Vec<PriorityClassStats> {
        self.priorities.stats()
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    /// Spawn the background machinery: throttle flusher, health poller,
    /// adaptive priority controller, metrics exporter, anomaly feed and the
    /// sync loop. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tasks = self.tasks.lock().expect("shield tasks poisoned");

        tasks.push(tokio::spawn(
            self.throttler.clone().run_flusher(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.overload
                .clone()
                .run_health(self.health_indicator.clone(), self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.priorities.clone().run_adaptive(self.shutdown_tx.subscribe()),
        ));

        if let Some(detector) = self.anomaly_detector.lock().expect("shield tasks poisoned").take()
        {
            let samples = self.metrics.open_anomaly_feed(1024);
            let feed = AnomalyFeed::new(
                detector,
                self.overload.threshold_handle(),
                1,
                usize::MAX,
                self.metrics.clone(),
            );
            tasks.push(tokio::spawn(feed.run(samples, self.shutdown_tx.subscribe())));
        }

        if let Some(sync) = &self.sync {
            tasks.push(tokio::spawn(sync.clone().run(self.shutdown_tx.subscribe())));
        }

        {
            let metrics = self.metrics.clone();
            let interval = self.metrics_export_interval;
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => metrics.export_once().await,
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        tracing::info!("shield started");
    }

    /// Graceful shutdown: stop sync, reject all queued work, drain
    /// in-flight requests, disable breakers, flush pending writes.
    pub async fn shutdown(&self, timeout: Duration) {
        tracing::info!(?timeout, "shield shutting down");
        let _ = self.shutdown_tx.send(true);

        if let Some(sync) = &self.sync {
            sync.unregister().await;
        }
        self.overload.clear_queue();

        // Drain in-flight work, capped at 80% of the budget or one minute.
        let drain_cap = Duration::from_millis(
            ((timeout.as_millis() as f64 * 0.8) as u64).min(60_000),
        );
        let drain_started = std::time::Instant::now();
        while drain_started.elapsed() < drain_cap {
            if self.overload.status().current == 0 && self.priorities.total_in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let drained = self.overload.status().current == 0;
        if !drained {
            tracing::warn!(
                remaining = self.overload.status().current,
                "drain window elapsed with requests still in flight"
            );
        }

        self.breakers.disable_all();
        self.throttler.flush_now().await;
        self.metrics.export_once().await;

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("shield tasks poisoned");
            tasks.drain(..).collect()
        };
        if tokio::time::timeout(Duration::from_secs(1), futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("background tasks did not stop in time");
        }
        tracing::info!("shield shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::ProtectionContext;
    use crate::error::{GuardError, ShieldError};
    use std::convert::Infallible;

    fn base_builder(clock: &ManualClock) -> ShieldBuilder {
        Shield::builder()
            .clock(Arc::new(clock.clone()))
            .store(Arc::new(MemoryStore::with_clock(Arc::new(clock.clone()))))
    }

    #[tokio::test]
    async fn invalid_configuration_fails_the_build() {
        let cfg = RateLimitConfig { enabled: true, points: 0, ..RateLimitConfig::default() };
        let result = Shield::builder().rate_limit(cfg).build();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn built_shield_protects_requests_end_to_end() {
        let clock = ManualClock::new(0);
        let shield = base_builder(&clock)
            .rate_limit(RateLimitConfig::new(2, Duration::from_secs(60)).unwrap())
            .build()
            .unwrap();
        let guard = shield.guard();

        let ctx = ProtectionContext::builder("GET", "/api")
            .ip("203.0.113.9".parse().unwrap())
            .build(&clock);
        for _ in 0..2 {
            let out = guard
                .protect(&ctx, || async { Ok::<_, Infallible>("ok") })
                .await
                .unwrap();
            assert_eq!(out.value, "ok");
        }
        let err = guard
            .protect(&ctx, || async { Ok::<_, Infallible>("ok") })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GuardError::Rejected(ShieldError::RateLimitExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let clock = ManualClock::new(0);
        let shield = base_builder(&clock).build().unwrap();
        shield.start();
        let first = shield.tasks.lock().unwrap().len();
        shield.start();
        assert_eq!(shield.tasks.lock().unwrap().len(), first);
        shield.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn shutdown_clears_queue_drains_and_disables_breakers() {
        let clock = ManualClock::new(0);
        let shield = Arc::new(
            base_builder(&clock)
                .overload(OverloadConfig {
                    enabled: true,
                    max_concurrent: 1,
                    max_queue_size: 8,
                    queue_timeout: Duration::from_secs(30),
                    ..OverloadConfig::default()
                })
                .build()
                .unwrap(),
        );
        shield.start();
        shield.breakers.get_or_create("orders", None);

        // One slow in-flight request holds the only slot.
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let in_flight = {
            let guard = shield.guard();
            let ctx = ProtectionContext::builder("GET", "/slow")
                .ip("203.0.113.9".parse().unwrap())
                .build(&clock);
            tokio::spawn(async move {
                guard
                    .protect(&ctx, move || async move {
                        let _ = gate_rx.await;
                        Ok::<_, Infallible>("slow done")
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(shield.overload_status().current, 1);

        // Four more requests pile up in the overload queue.
        let queued: Vec<_> = (0..4)
            .map(|i| {
                let guard = shield.guard();
                let ctx = ProtectionContext::builder("GET", "/slow")
                    .ip("203.0.113.9".parse().unwrap())
                    .request_id(format!("queued-{}", i))
                    .build(&clock);
                tokio::spawn(async move {
                    guard
                        .protect(&ctx, || async { Ok::<_, Infallible>("queued done") })
                        .await
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(shield.overload_status().queued, 4);

        // Shutdown: release the in-flight request shortly after it begins.
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = gate_tx.send(());
        });
        shield.shutdown(Duration::from_secs(5)).await;

        for handle in queued {
            let result = handle.await.unwrap();
            assert!(matches!(
                result.unwrap_err(),
                GuardError::Rejected(ShieldError::QueueCleared)
            ));
        }
        let finished = in_flight.await.unwrap().unwrap();
        assert_eq!(finished.value, "slow done");
        releaser.await.unwrap();

        assert_eq!(shield.overload_status().current, 0);
        assert!(shield
            .breaker_snapshots()
            .iter()
            .all(|s| s.state == crate::circuit_breaker::BreakerState::Disabled));
    }
}
