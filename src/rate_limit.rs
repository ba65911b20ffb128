//! Fixed-window rate limiting over the pluggable store.
//!
//! The counter is incremented atomically before the limit check, so every
//! attempt in a window stays visible in the counter; policy simply never
//! admits more than `points` of them. Store failures fail open: availability
//! outranks perfect accounting, and the only hard failure surface is
//! [`ShieldError::RateLimitExceeded`].

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::context::ProtectionContext;
use crate::error::{ShieldError, StoreError};
use crate::metrics::{labels, Labels, MetricsSink};
use crate::store::Store;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Window-key cache bound; the oldest tenth is evicted when it fills.
const KEY_CACHE_CAPACITY: usize = 10_000;
const KEY_CACHE_EVICT: usize = KEY_CACHE_CAPACITY / 10;

/// Explicit block record stored at `block:<ip>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockRecord {
    pub reason: String,
    pub timestamp_millis: u64,
}

/// Result of an allowed consume.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitOutcome {
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds at which the current window ends.
    pub reset_epoch_secs: u64,
    pub headers: Vec<(String, String)>,
}

pub struct RateLimiter {
    store: Arc<dyn Store>,
    metrics: MetricsSink,
    clock: Arc<dyn Clock>,
    key_cache: Mutex<LruCache<(IpAddr, String, String), String>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, metrics: MetricsSink, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            metrics,
            clock,
            key_cache: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Consume one point for this request.
    ///
    /// Returns the outcome with response headers on allow, or
    /// [`ShieldError::RateLimitExceeded`] when the window is exhausted.
    pub async fn consume(
        &self,
        ctx: &ProtectionContext,
        cfg: &RateLimitConfig,
    ) -> Result<RateLimitOutcome, ShieldError> {
        let now_millis = self.clock.now_millis();
        let duration_secs = cfg.duration.as_secs().max(1);
        let window_start = now_millis / 1000 / duration_secs * duration_secs;
        let reset_epoch_secs = window_start + duration_secs;

        let scope = self.scope_for(ctx, cfg);
        let key = format!("rate_limit:{}:{}", scope, window_start);

        let count = match self.store.incr_by(&key, 1).await {
            Ok(count) => count,
            Err(err) => return Ok(self.fail_open(cfg, reset_epoch_secs, err)),
        };
        if count == 1 {
            // First hit of the window owns the expiry.
            if let Err(err) = self.store.expire(&key, cfg.duration).await {
                tracing::warn!(key = %key, error = %err, "failed to set window expiry");
            }
        }

        self.metrics.increment(
            "rate_limit_consumed",
            1,
            labels([("method", ctx.method()), ("path", ctx.path())]),
        );

        if count > i64::from(cfg.points) {
            let retry_after = retry_after_secs(reset_epoch_secs, now_millis);
            self.metrics.increment("rate_limit_rejected", 1, Labels::new());
            return Err(ShieldError::RateLimitExceeded {
                limit: cfg.points,
                retry_after: Duration::from_secs(retry_after),
            });
        }

        let remaining = cfg.points.saturating_sub(count.max(0) as u32);
        Ok(self.outcome(cfg, remaining, reset_epoch_secs))
    }

    /// Refund the point consumed for this request. Used by the guard when
    /// `skip_successful` / `skip_failed` applies to the handler outcome.
    pub async fn refund(&self, ctx: &ProtectionContext, cfg: &RateLimitConfig) {
        let duration_secs = cfg.duration.as_secs().max(1);
        let window_start = self.clock.now_millis() / 1000 / duration_secs * duration_secs;
        let key = format!("rate_limit:{}:{}", self.scope_for(ctx, cfg), window_start);
        if let Err(err) = self.store.incr_by(&key, -1).await {
            tracing::warn!(key = %key, error = %err, "failed to refund rate limit point");
        }
    }

    /// Drop the current window counter so the next consume starts fresh.
    pub async fn reset(
        &self,
        ctx: &ProtectionContext,
        cfg: &RateLimitConfig,
    ) -> Result<(), StoreError> {
        let duration_secs = cfg.duration.as_secs().max(1);
        let window_start = self.clock.now_millis() / 1000 / duration_secs * duration_secs;
        let key = format!("rate_limit:{}:{}", self.scope_for(ctx, cfg), window_start);
        self.store.delete(&key).await?;
        Ok(())
    }

    /// Write an explicit block record for this caller's address.
    pub async fn block(
        &self,
        ip: IpAddr,
        duration: Duration,
        reason: impl Into<String>,
    ) -> Result<(), StoreError> {
        let record = BlockRecord {
            reason: reason.into(),
            timestamp_millis: self.clock.now_millis(),
        };
        self.store
            .set(
                &format!("block:{}", ip),
                serde_json::to_value(&record)?,
                Some(duration),
            )
            .await?;
        self.metrics.increment("rate_limit_blocks", 1, Labels::new());
        Ok(())
    }

    pub async fn unblock(&self, ip: IpAddr) -> Result<bool, StoreError> {
        self.store.delete(&format!("block:{}", ip)).await
    }

    /// Active block for this address, with the remaining block time.
    pub async fn blocked(
        &self,
        ip: IpAddr,
    ) -> Result<Option<(BlockRecord, Duration)>, StoreError> {
        let key = format!("block:{}", ip);
        let Some(value) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let record: BlockRecord = serde_json::from_value(value)?;
        let remaining = match self.store.ttl(&key).await? {
            secs if secs > 0 => Duration::from_secs(secs as u64),
            _ => Duration::from_secs(1),
        };
        Ok(Some((record, remaining)))
    }

    fn outcome(
        &self,
        cfg: &RateLimitConfig,
        remaining: u32,
        reset_epoch_secs: u64,
    ) -> RateLimitOutcome {
        let mut headers = vec![
            ("X-RateLimit-Limit".to_string(), cfg.points.to_string()),
            ("X-RateLimit-Remaining".to_string(), remaining.to_string()),
            ("X-RateLimit-Reset".to_string(), reset_epoch_secs.to_string()),
        ];
        headers.extend(cfg.custom_headers.iter().cloned());
        RateLimitOutcome { limit: cfg.points, remaining, reset_epoch_secs, headers }
    }

    fn fail_open(
        &self,
        cfg: &RateLimitConfig,
        reset_epoch_secs: u64,
        err: StoreError,
    ) -> RateLimitOutcome {
        tracing::warn!(error = %err, "rate limit store unavailable, failing open");
        self.metrics.increment("rate_limit_error", 1, Labels::new());
        self.outcome(cfg, cfg.points, reset_epoch_secs)
    }

    /// Extractor key for this request. The default identity+route scope is
    /// cached by `(ip, path, method)` so the string assembly is done once
    /// per burst; custom extractors bypass the cache.
    fn scope_for(&self, ctx: &ProtectionContext, cfg: &RateLimitConfig) -> String {
        if let Some(extractor) = &cfg.key_extractor {
            return extractor(ctx);
        }
        let cache_key = (ctx.ip(), ctx.path().to_string(), ctx.method().to_string());
        let mut cache = self.key_cache.lock().expect("rate limit cache poisoned");
        if let Some(scope) = cache.get(&cache_key) {
            return scope.clone();
        }
        if cache.len() >= KEY_CACHE_CAPACITY {
            for _ in 0..KEY_CACHE_EVICT {
                cache.pop_lru();
            }
        }
        let scope = ctx.route_scope();
        cache.put(cache_key, scope.clone());
        scope
    }
}

fn retry_after_secs(reset_epoch_secs: u64, now_millis: u64) -> u64 {
    let reset_millis = reset_epoch_secs * 1000;
    ((reset_millis.saturating_sub(now_millis) + 999) / 1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::Value;

    fn limiter_at(epoch_millis: u64) -> (RateLimiter, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::new(epoch_millis);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = RateLimiter::new(
            store.clone(),
            MetricsSink::with_clock(Arc::new(clock.clone())),
            Arc::new(clock.clone()),
        );
        (limiter, clock, store)
    }

    fn ctx(clock: &ManualClock) -> ProtectionContext {
        ProtectionContext::builder("GET", "/orders")
            .ip("1.2.3.4".parse().unwrap())
            .build(clock)
    }

    fn cfg(points: u32, duration_secs: u64) -> RateLimitConfig {
        RateLimitConfig::new(points, Duration::from_secs(duration_secs)).unwrap()
    }

    #[tokio::test]
    async fn fixed_window_counts_down_then_rejects() {
        let (limiter, clock, _) = limiter_at(0);
        let cfg = cfg(5, 60);
        let ctx = ctx(&clock);

        for expected_remaining in (0..5).rev() {
            let outcome = limiter.consume(&ctx, &cfg).await.unwrap();
            assert_eq!(outcome.remaining, expected_remaining);
            assert_eq!(outcome.reset_epoch_secs, 60);
        }

        clock.set(10_000);
        let err = limiter.consume(&ctx, &cfg).await.unwrap_err();
        match err {
            ShieldError::RateLimitExceeded { limit, retry_after } => {
                assert_eq!(limit, 5);
                assert_eq!(retry_after, Duration::from_secs(50));
            }
            other => panic!("expected rate limit rejection, got {:?}", other),
        }

        // New window at t=60 starts fresh.
        clock.set(60_000);
        let outcome = limiter.consume(&ctx, &cfg).await.unwrap();
        assert_eq!(outcome.remaining, 4);
        assert_eq!(outcome.reset_epoch_secs, 120);
    }

    #[tokio::test]
    async fn headers_carry_limit_remaining_and_reset() {
        let (limiter, clock, _) = limiter_at(5_000);
        let cfg = cfg(10, 60);
        let outcome = limiter.consume(&ctx(&clock), &cfg).await.unwrap();

        let get = |name: &str| {
            outcome
                .headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(get("X-RateLimit-Limit"), "10");
        assert_eq!(get("X-RateLimit-Remaining"), "9");
        assert_eq!(get("X-RateLimit-Reset"), "60");
    }

    #[tokio::test]
    async fn rejections_keep_counting_attempts() {
        let (limiter, clock, store) = limiter_at(0);
        let cfg = cfg(2, 60);
        let ctx = ctx(&clock);

        limiter.consume(&ctx, &cfg).await.unwrap();
        limiter.consume(&ctx, &cfg).await.unwrap();
        for _ in 0..3 {
            assert!(limiter.consume(&ctx, &cfg).await.is_err());
        }

        let keys = store.scan("rate_limit:*").await.unwrap();
        assert_eq!(keys.len(), 1);
        let count = store.get(&keys[0]).await.unwrap().unwrap();
        assert_eq!(count, Value::from(5));
    }

    #[tokio::test]
    async fn window_counter_expires_with_the_window() {
        let (limiter, clock, store) = limiter_at(0);
        let cfg = cfg(5, 60);
        limiter.consume(&ctx(&clock), &cfg).await.unwrap();
        assert_eq!(store.scan("rate_limit:*").await.unwrap().len(), 1);

        clock.advance(60_000);
        assert!(store.scan("rate_limit:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn custom_extractor_scopes_the_counter() {
        let (limiter, clock, _) = limiter_at(0);
        let mut cfg = cfg(1, 60);
        cfg.key_extractor = Some(Arc::new(|ctx: &ProtectionContext| {
            ctx.session_id().unwrap_or("anon").to_string()
        }));

        let a = ProtectionContext::builder("GET", "/x").session_id("s1").build(&clock);
        let b = ProtectionContext::builder("GET", "/x").session_id("s2").build(&clock);

        assert!(limiter.consume(&a, &cfg).await.is_ok());
        assert!(limiter.consume(&a, &cfg).await.is_err());
        assert!(limiter.consume(&b, &cfg).await.is_ok());
    }

    #[tokio::test]
    async fn reset_restores_the_first_call_view() {
        let (limiter, clock, _) = limiter_at(0);
        let cfg = cfg(3, 60);
        let ctx = ctx(&clock);

        limiter.consume(&ctx, &cfg).await.unwrap();
        limiter.consume(&ctx, &cfg).await.unwrap();
        limiter.reset(&ctx, &cfg).await.unwrap();

        let outcome = limiter.consume(&ctx, &cfg).await.unwrap();
        assert_eq!(outcome.remaining, 2);
    }

    #[tokio::test]
    async fn block_round_trips_for_exactly_the_block_duration() {
        let (limiter, clock, _) = limiter_at(0);
        let ip: IpAddr = "9.9.9.9".parse().unwrap();

        limiter.block(ip, Duration::from_secs(30), "abuse").await.unwrap();
        let (record, remaining) = limiter.blocked(ip).await.unwrap().unwrap();
        assert_eq!(record.reason, "abuse");
        assert_eq!(remaining, Duration::from_secs(30));

        clock.advance(29_999);
        assert!(limiter.blocked(ip).await.unwrap().is_some());

        clock.advance(1);
        assert!(limiter.blocked(ip).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unblock_clears_an_active_block() {
        let (limiter, _, _) = limiter_at(0);
        let ip: IpAddr = "9.9.9.9".parse().unwrap();
        limiter.block(ip, Duration::from_secs(30), "abuse").await.unwrap();
        assert!(limiter.unblock(ip).await.unwrap());
        assert!(limiter.blocked(ip).await.unwrap().is_none());
    }

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl Store for BrokenStore {
        async fn get(&self, _: &str) -> Result<Option<Value>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn set(&self, _: &str, _: Value, _: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn incr_by(&self, _: &str, _: i64) -> Result<i64, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn ttl(&self, _: &str) -> Result<i64, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn scan(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn mget(&self, _: &[String]) -> Result<Vec<Option<Value>>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn mset(&self, _: &[(String, Value)], _: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
    }

    #[tokio::test]
    async fn store_failures_fail_open_with_a_metric() {
        let clock = ManualClock::new(0);
        let metrics = MetricsSink::with_clock(Arc::new(clock.clone()));
        let limiter =
            RateLimiter::new(Arc::new(BrokenStore), metrics.clone(), Arc::new(clock.clone()));
        let cfg = cfg(1, 60);
        let ctx = ctx(&clock);

        // Even past the limit every call is allowed while the store is down.
        for _ in 0..5 {
            assert!(limiter.consume(&ctx, &cfg).await.is_ok());
        }
        let snapshot = metrics.snapshot();
        let errors = snapshot.iter().find(|s| s.name == "rate_limit_error").unwrap();
        assert!(matches!(
            errors.kind,
            crate::metrics::SnapshotKind::Counter { total: 5, .. }
        ));
    }
}
