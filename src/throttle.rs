//! Short-window throttling anchored to each caller's first request.
//!
//! Counting happens against a local cache so the request path never waits on
//! the store; dirty records are flushed in batches by a background task.
//! Flush failures log and are retried on the next tick, never propagated.

use crate::clock::Clock;
use crate::config::ThrottleConfig;
use crate::context::ProtectionContext;
use crate::error::ShieldError;
use crate::metrics::{Labels, MetricsSink};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const SHARDS: usize = 16;
/// How long a cached record is trusted before re-reading the store.
const CACHE_FRESHNESS: Duration = Duration::from_secs(30);
/// Batched write cadence.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Store-resident throttle state for one caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThrottleRecord {
    pub count: u32,
    pub first_request_millis: u64,
}

impl ThrottleRecord {
    fn window_end_millis(&self, ttl: Duration) -> u64 {
        self.first_request_millis + ttl.as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedRecord {
    record: ThrottleRecord,
    fetched_at_millis: u64,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    record: ThrottleRecord,
    window_ttl: Duration,
}

/// Result of an allowed consume.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleOutcome {
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch_secs: u64,
    pub headers: Vec<(String, String)>,
    /// True when the user agent matched the allowlist and nothing counted.
    pub ignored: bool,
}

pub struct Throttler {
    store: Arc<dyn Store>,
    metrics: MetricsSink,
    clock: Arc<dyn Clock>,
    cache: [Mutex<HashMap<String, CachedRecord>>; SHARDS],
    pending: Mutex<HashMap<String, PendingWrite>>,
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler").finish_non_exhaustive()
    }
}

impl Throttler {
    pub fn new(store: Arc<dyn Store>, metrics: MetricsSink, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            metrics,
            clock,
            cache: std::array::from_fn(|_| Mutex::new(HashMap::new())),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Count this request against its caller's anchored window.
    pub async fn consume(
        &self,
        ctx: &ProtectionContext,
        cfg: &ThrottleConfig,
    ) -> Result<ThrottleOutcome, ShieldError> {
        let now = self.clock.now_millis();

        if let Some(agent) = ctx.user_agent() {
            if cfg.ignore_user_agents.iter().any(|re| re.is_match(agent)) {
                return Ok(ThrottleOutcome {
                    limit: cfg.limit,
                    remaining: cfg.limit,
                    reset_epoch_secs: (now + cfg.ttl.as_millis() as u64) / 1000,
                    headers: Vec::new(),
                    ignored: true,
                });
            }
        }

        let key = self.key_for(ctx, cfg);
        let cached = self.cached(&key, now);
        let record = match cached {
            Some(record) => record,
            None => self.read_through(&key, now).await,
        };

        let record = match record {
            Some(record) if now <= record.window_end_millis(cfg.ttl) => record,
            // Missing or lapsed: anchor a fresh window at this request.
            _ => {
                let fresh = ThrottleRecord { count: 0, first_request_millis: now };
                self.store_cached(&key, fresh, now);
                fresh
            }
        };

        if record.count >= cfg.limit {
            let window_end = record.window_end_millis(cfg.ttl);
            let retry_after = ((window_end.saturating_sub(now) + 999) / 1000).max(1);
            self.metrics.increment("throttle_rejected", 1, Labels::new());
            return Err(ShieldError::ThrottleLimitExceeded {
                limit: cfg.limit,
                retry_after: Duration::from_secs(retry_after),
            });
        }

        let updated = ThrottleRecord {
            count: record.count + 1,
            first_request_millis: record.first_request_millis,
        };
        self.store_cached(&key, updated, now);
        self.mark_dirty(&key, updated, cfg.ttl);
        self.metrics.increment("throttle_consumed", 1, Labels::new());

        Ok(self.outcome(cfg, updated))
    }

    /// Forget this caller's window, in cache, pending queue and store.
    pub async fn reset(&self, ctx: &ProtectionContext, cfg: &ThrottleConfig) {
        let key = self.key_for(ctx, cfg);
        self.shard(&key).lock().expect("throttle cache poisoned").remove(&key);
        self.pending.lock().expect("throttle queue poisoned").remove(&key);
        if let Err(err) = self.store.delete(&key).await {
            tracing::warn!(key = %key, error = %err, "failed to reset throttle record");
        }
    }

    /// Drain the dirty queue into the store. Called by the background
    /// flusher and once more during shutdown.
    pub async fn flush_now(&self) {
        let drained: Vec<(String, PendingWrite)> = {
            let mut pending = self.pending.lock().expect("throttle queue poisoned");
            pending.drain().collect()
        };
        if drained.is_empty() {
            return;
        }

        let now = self.clock.now_millis();
        for (key, write) in drained {
            let remaining =
                write.record.window_end_millis(write.window_ttl).saturating_sub(now);
            if remaining == 0 {
                continue;
            }
            let value = match serde_json::to_value(write.record) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "unserialisable throttle record");
                    continue;
                }
            };
            if let Err(err) =
                self.store.set(&key, value, Some(Duration::from_millis(remaining))).await
            {
                self.metrics.increment("throttle_flush_error", 1, Labels::new());
                tracing::warn!(key = %key, error = %err, "throttle flush failed");
            }
        }
    }

    /// Flush loop. Runs until shutdown is signalled.
    pub async fn run_flusher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.flush_now().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.flush_now().await;
                        break;
                    }
                }
            }
        }
    }

    fn outcome(&self, cfg: &ThrottleConfig, record: ThrottleRecord) -> ThrottleOutcome {
        let remaining = cfg.limit - record.count;
        let reset_epoch_secs = record.window_end_millis(cfg.ttl) / 1000;
        let headers = vec![
            ("X-Throttle-Limit".to_string(), cfg.limit.to_string()),
            ("X-Throttle-TTL".to_string(), cfg.ttl.as_secs().to_string()),
            ("X-Throttle-Remaining".to_string(), remaining.to_string()),
            ("X-Throttle-Reset".to_string(), reset_epoch_secs.to_string()),
        ];
        ThrottleOutcome { limit: cfg.limit, remaining, reset_epoch_secs, headers, ignored: false }
    }

    fn key_for(&self, ctx: &ProtectionContext, cfg: &ThrottleConfig) -> String {
        match &cfg.key_extractor {
            Some(extractor) => format!("throttle:{}", extractor(ctx)),
            None => format!("throttle:{}", ctx.identity()),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, CachedRecord>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.cache[(hasher.finish() as usize) % SHARDS]
    }

    fn cached(&self, key: &str, now: u64) -> Option<Option<ThrottleRecord>> {
        let cache = self.shard(key).lock().expect("throttle cache poisoned");
        cache.get(key).and_then(|cached| {
            (now.saturating_sub(cached.fetched_at_millis)
                <= CACHE_FRESHNESS.as_millis() as u64)
                .then_some(Some(cached.record))
        })
    }

    async fn read_through(&self, key: &str, now: u64) -> Option<ThrottleRecord> {
        let record = match self.store.get(key).await {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            Ok(None) => None,
            Err(err) => {
                // Fail open: a fresh window is the availability-preserving view.
                tracing::warn!(key = %key, error = %err, "throttle store read failed");
                self.metrics.increment("throttle_error", 1, Labels::new());
                None
            }
        };
        if let Some(record) = record {
            self.store_cached(key, record, now);
        }
        record
    }

    fn store_cached(&self, key: &str, record: ThrottleRecord, now: u64) {
        self.shard(key)
            .lock()
            .expect("throttle cache poisoned")
            .insert(key.to_string(), CachedRecord { record, fetched_at_millis: now });
    }

    fn mark_dirty(&self, key: &str, record: ThrottleRecord, window_ttl: Duration) {
        self.pending
            .lock()
            .expect("throttle queue poisoned")
            .insert(key.to_string(), PendingWrite { record, window_ttl });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn throttler_at(millis: u64) -> (Arc<Throttler>, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::new(millis);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let throttler = Arc::new(Throttler::new(
            store.clone(),
            MetricsSink::with_clock(Arc::new(clock.clone())),
            Arc::new(clock.clone()),
        ));
        (throttler, clock, store)
    }

    fn ctx(clock: &ManualClock) -> ProtectionContext {
        ProtectionContext::builder("GET", "/search")
            .ip("1.2.3.4".parse().unwrap())
            .build(clock)
    }

    fn cfg(limit: u32, ttl_secs: u64) -> ThrottleConfig {
        ThrottleConfig::new(limit, Duration::from_secs(ttl_secs)).unwrap()
    }

    #[tokio::test]
    async fn window_is_anchored_to_the_first_request() {
        let (throttler, clock, _) = throttler_at(0);
        let cfg = cfg(3, 10);
        let ctx = ctx(&clock);

        assert!(throttler.consume(&ctx, &cfg).await.is_ok()); // t=0
        clock.set(4_000);
        assert!(throttler.consume(&ctx, &cfg).await.is_ok()); // t=4
        clock.set(9_000);
        assert!(throttler.consume(&ctx, &cfg).await.is_ok()); // t=9

        clock.set(9_500);
        match throttler.consume(&ctx, &cfg).await.unwrap_err() {
            ShieldError::ThrottleLimitExceeded { limit, retry_after } => {
                assert_eq!(limit, 3);
                assert_eq!(retry_after, Duration::from_secs(1));
            }
            other => panic!("expected throttle rejection, got {:?}", other),
        }

        // Past the anchored window a fresh one starts at t=11.
        clock.set(11_000);
        let outcome = throttler.consume(&ctx, &cfg).await.unwrap();
        assert_eq!(outcome.remaining, 2);
        assert_eq!(outcome.reset_epoch_secs, 21);
    }

    #[tokio::test]
    async fn allowlisted_user_agents_are_never_counted() {
        let (throttler, clock, _) = throttler_at(0);
        let cfg = cfg(1, 10).ignore_user_agents(["^kube-probe/"]).unwrap();
        let probe = ProtectionContext::builder("GET", "/health")
            .header("User-Agent", "kube-probe/1.29")
            .build(&clock);

        for _ in 0..5 {
            let outcome = throttler.consume(&probe, &cfg).await.unwrap();
            assert!(outcome.ignored);
            assert!(outcome.headers.is_empty());
        }
    }

    #[tokio::test]
    async fn headers_expose_the_window_state() {
        let (throttler, clock, _) = throttler_at(2_000);
        let cfg = cfg(5, 10);
        let outcome = throttler.consume(&ctx(&clock), &cfg).await.unwrap();

        let get = |name: &str| {
            outcome
                .headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(get("X-Throttle-Limit"), "5");
        assert_eq!(get("X-Throttle-TTL"), "10");
        assert_eq!(get("X-Throttle-Remaining"), "4");
        assert_eq!(get("X-Throttle-Reset"), "12");
    }

    #[tokio::test]
    async fn flush_persists_dirty_records_with_remaining_ttl() {
        let (throttler, clock, store) = throttler_at(0);
        let cfg = cfg(5, 10);
        let ctx = ctx(&clock);

        throttler.consume(&ctx, &cfg).await.unwrap();
        throttler.consume(&ctx, &cfg).await.unwrap();
        assert!(store.scan("throttle:*").await.unwrap().is_empty());

        clock.set(3_000);
        throttler.flush_now().await;
        let keys = store.scan("throttle:*").await.unwrap();
        assert_eq!(keys.len(), 1);

        let record: ThrottleRecord =
            serde_json::from_value(store.get(&keys[0]).await.unwrap().unwrap()).unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.first_request_millis, 0);
        assert_eq!(store.ttl(&keys[0]).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn counting_survives_cache_refresh_from_the_store() {
        let (throttler, clock, store) = throttler_at(0);
        let cfg = cfg(3, 120);
        let ctx = ctx(&clock);

        throttler.consume(&ctx, &cfg).await.unwrap();
        throttler.consume(&ctx, &cfg).await.unwrap();
        throttler.flush_now().await;

        // Past cache freshness the record is re-read from the store.
        clock.set(40_000);
        let outcome = throttler.consume(&ctx, &cfg).await.unwrap();
        assert_eq!(outcome.remaining, 0);
        assert!(throttler.consume(&ctx, &cfg).await.is_err());
        let _ = store;
    }

    #[tokio::test]
    async fn reset_then_consume_matches_a_first_ever_call() {
        let (throttler, clock, _) = throttler_at(0);
        let cfg = cfg(2, 10);
        let ctx = ctx(&clock);

        throttler.consume(&ctx, &cfg).await.unwrap();
        throttler.consume(&ctx, &cfg).await.unwrap();
        assert!(throttler.consume(&ctx, &cfg).await.is_err());

        clock.set(5_000);
        throttler.reset(&ctx, &cfg).await;
        let outcome = throttler.consume(&ctx, &cfg).await.unwrap();
        assert_eq!(outcome.remaining, 1);
        // Fresh window anchored at the post-reset request.
        assert_eq!(outcome.reset_epoch_secs, 15);
    }

    #[tokio::test]
    async fn flusher_task_drains_on_interval() {
        let (throttler, clock, store) = throttler_at(0);
        let cfg = cfg(5, 10);
        throttler.consume(&ctx(&clock), &cfg).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(throttler.clone().run_flusher(shutdown_rx));

        for _ in 0..200 {
            if !store.scan("throttle:*").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.scan("throttle:*").await.unwrap().len(), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
