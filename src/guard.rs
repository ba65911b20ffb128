//! The orchestrating guard: one entry point per request, fixed pipeline
//! order, first rejection wins.
//!
//! Order: global disable / bypass / trusted source, then the blocked-caller
//! check, priority admission, the overload slot, rate limit, throttle and
//! the circuit breaker's admission check, then security screening, and
//! finally the breaker-wrapped handler. Anything that is not one of the
//! protection rejections fails open.

use crate::circuit_breaker::BreakerError;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::clock::Clock;
use crate::config::{EffectiveProtection, GuardConfig, RouteOverrides};
use crate::context::ProtectionContext;
use crate::error::{GuardError, ShieldError};
use crate::metrics::{labels, MetricsSink};
use crate::overload::OverloadController;
use crate::priority::PriorityManager;
use crate::rate_limit::RateLimiter;
use crate::throttle::Throttler;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

/// Per-request synthetic response producer used instead of `CIRCUIT_OPEN`.
pub type FallbackFn<T> = Arc<dyn Fn(&ProtectionContext) -> T + Send + Sync>;

/// Successful pipeline result: the handler value plus response headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Protected<T> {
    pub value: T,
    pub headers: Vec<(String, String)>,
    pub request_id: String,
}

/// Fully rendered rejection for the HTTP layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

/// Pre-merged per-route protection, looked up by handler id.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    inner: RwLock<HashMap<String, EffectiveProtection>>,
}

impl RouteRegistry {
    fn insert(&self, handler_id: String, merged: EffectiveProtection) {
        self.inner.write().expect("route registry poisoned").insert(handler_id, merged);
    }

    fn get(&self, handler_id: &str) -> Option<EffectiveProtection> {
        self.inner.read().expect("route registry poisoned").get(handler_id).cloned()
    }
}

pub struct Guard {
    cfg: GuardConfig,
    global: EffectiveProtection,
    routes: RouteRegistry,
    rate_limiter: Arc<RateLimiter>,
    throttler: Arc<Throttler>,
    priorities: Arc<PriorityManager>,
    overload: OverloadController,
    breakers: CircuitBreakerRegistry,
    metrics: MetricsSink,
    clock: Arc<dyn Clock>,
    shutdown_mode: AtomicBool,
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("enabled", &self.cfg.enabled)
            .field("shutdown_mode", &self.shutdown_mode.load(Ordering::Relaxed))
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
impl Guard {
    pub fn new(
        cfg: GuardConfig,
        global: EffectiveProtection,
        rate_limiter: Arc<RateLimiter>,
        throttler: Arc<Throttler>,
        priorities: Arc<PriorityManager>,
        overload: OverloadController,
        breakers: CircuitBreakerRegistry,
        metrics: MetricsSink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shutdown_mode = std::env::var("SHIELD_SHUTDOWN_MODE")
            .map(|v| v == "true")
            .unwrap_or(false);
        Self {
            cfg,
            global,
            routes: RouteRegistry::default(),
            rate_limiter,
            throttler,
            priorities,
            overload,
            breakers,
            metrics,
            clock,
            shutdown_mode: AtomicBool::new(shutdown_mode),
        }
    }

    /// Register a route's overrides, pre-merged left-to-right over the
    /// global defaults (global ← class ← method). Called by the routing
    /// integration at registration time so the hot path only indexes.
    pub fn register_route(&self, handler_id: impl Into<String>, layers: &[RouteOverrides]) {
        let merged = layers
            .iter()
            .fold(self.global.clone(), |base, overrides| overrides.merge_over(&base));
        self.routes.insert(handler_id.into(), merged);
    }

    /// Toggle emergency bypass at runtime (`SHIELD_SHUTDOWN_MODE` is the
    /// boot-time source).
    pub fn set_shutdown_mode(&self, on: bool) {
        self.shutdown_mode.store(on, Ordering::Relaxed);
    }

    /// Run `handler` behind the full pipeline.
    pub async fn protect<T, E, F, Fut>(
        &self,
        ctx: &ProtectionContext,
        handler: F,
    ) -> Result<Protected<T>, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.protect_with_fallback(ctx, handler, None).await
    }

    /// Like [`Guard::protect`], with a synthetic response replacing
    /// `CIRCUIT_OPEN` when the route's breaker is open.
    pub async fn protect_with_fallback<T, E, F, Fut>(
        &self,
        ctx: &ProtectionContext,
        handler: F,
        fallback: Option<FallbackFn<T>>,
    ) -> Result<Protected<T>, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let started = Instant::now();

        if !self.cfg.enabled {
            return self.passthrough(ctx, handler).await;
        }
        if self.shutdown_mode.load(Ordering::Relaxed) {
            tracing::warn!(
                request_id = %ctx.request_id(),
                "SHIELD_SHUTDOWN_MODE active, bypassing all protection"
            );
            self.metrics.increment("guard_shutdown_bypass", 1, crate::metrics::Labels::new());
            return self.passthrough(ctx, handler).await;
        }

        let route = match ctx.handler_id().and_then(|id| self.routes.get(id)) {
            Some(route) => route,
            None => self.global.clone(),
        };
        if route.bypass {
            return self.passthrough(ctx, handler).await;
        }
        if is_trusted_source(ctx.ip())
            && self.cfg.trusted_paths.iter().any(|p| p == ctx.path())
        {
            return self.passthrough(ctx, handler).await;
        }

        match self.run_pipeline(ctx, &route, handler, fallback, started).await {
            Ok(protected) => {
                self.metrics.increment(
                    "guard_requests",
                    1,
                    labels([("outcome", "allowed")]),
                );
                Ok(protected)
            }
            Err(err) => {
                if let GuardError::Rejected(rejection) = &err {
                    self.metrics.increment(
                        "guard_requests",
                        1,
                        labels([("outcome", "rejected"), ("type", rejection.kind())]),
                    );
                    tracing::debug!(
                        request_id = %ctx.request_id(),
                        rejection = %rejection,
                        "request rejected"
                    );
                }
                Err(err)
            }
        }
    }

    /// Render the HTTP response for a pipeline rejection.
    pub fn rejection(&self, ctx: &ProtectionContext, err: &ShieldError) -> Rejection {
        let status = err.status_code();
        let mut headers = vec![
            ("X-Request-ID".to_string(), ctx.request_id().to_string()),
            ("X-Shield-Protected".to_string(), "true".to_string()),
        ];
        if let Some(retry_after) = err.retry_after() {
            headers.push(("Retry-After".to_string(), retry_after.to_string()));
        }
        if let ShieldError::CircuitOpen { retry_after, .. } = err {
            headers.push(("X-Circuit-Breaker-State".to_string(), "open".to_string()));
            let next_attempt = self.clock.now_secs() + retry_after.as_secs();
            headers.push((
                "X-Circuit-Breaker-Next-Attempt".to_string(),
                next_attempt.to_string(),
            ));
        }

        let route = ctx
            .handler_id()
            .and_then(|id| self.routes.get(id))
            .unwrap_or_else(|| self.global.clone());
        let custom_message = match err {
            ShieldError::RateLimitExceeded { .. } => {
                route.rate_limit.as_ref().and_then(|cfg| cfg.custom_message.clone())
            }
            _ => None,
        };
        let message = custom_message.unwrap_or_else(|| {
            if self.cfg.verbose_rejections {
                err.to_string()
            } else {
                default_message(status)
            }
        });
        let mut body = json!({
            "statusCode": status,
            "message": message,
            "error": "Shield Protection",
            "path": ctx.path(),
            "requestId": ctx.request_id(),
            "type": err.kind(),
        });
        if let Some(retry_after) = err.retry_after() {
            body["retryAfter"] = json!(retry_after);
        }
        Rejection { status, headers, body }
    }

    async fn run_pipeline<T, E, F, Fut>(
        &self,
        ctx: &ProtectionContext,
        route: &EffectiveProtection,
        handler: F,
        fallback: Option<FallbackFn<T>>,
        started: Instant,
    ) -> Result<Protected<T>, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        // Explicit blocks are checked before any counting. Store failures
        // inside `blocked` fail open.
        match self.rate_limiter.blocked(ctx.ip()).await {
            Ok(Some((record, remaining))) => {
                return Err(GuardError::Rejected(ShieldError::Blocked {
                    reason: record.reason,
                    retry_after: remaining,
                }));
            }
            Ok(None) => {}
            Err(err) => {
                self.fail_open("block check", &err);
            }
        }

        let priority = self.priorities.extract(ctx, route.priority);
        if !self.priorities.can_accept(priority) {
            return Err(GuardError::Rejected(ShieldError::PriorityQueueFull {
                class: priority,
                retry_after: self.priorities.timeout_for(priority),
            }));
        }
        let slot = self
            .priorities
            .acquire(priority)
            .await
            .map_err(GuardError::Rejected)?;

        let permit = self
            .overload
            .acquire(ctx.request_id(), priority)
            .await
            .map_err(GuardError::Rejected)?;

        let mut headers = vec![
            ("X-Request-ID".to_string(), ctx.request_id().to_string()),
            ("X-Shield-Protected".to_string(), "true".to_string()),
        ];

        let rate_cfg = route.rate_limit.as_ref().filter(|c| c.enabled);
        if let Some(cfg) = rate_cfg {
            let outcome = self
                .rate_limiter
                .consume(ctx, cfg)
                .await
                .map_err(GuardError::Rejected)?;
            headers.extend(outcome.headers);
        }

        if let Some(cfg) = route.throttle.as_ref().filter(|c| c.enabled) {
            let outcome = self
                .throttler
                .consume(ctx, cfg)
                .await
                .map_err(GuardError::Rejected)?;
            headers.extend(outcome.headers);
        }

        let breaker_cfg = route.circuit_breaker.as_ref().filter(|c| c.enabled);
        let breaker = breaker_cfg.map(|cfg| {
            let key = ctx
                .handler_id()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} {}", ctx.method(), ctx.path()));
            self.breakers.get_or_create(&key, Some(cfg))
        });

        // The breaker's admission check closes out the mechanism sequence:
        // an open circuit short-circuits here, before security screening.
        if let Some(breaker) = &breaker {
            if let Some(retry_after) = breaker.check_rejected() {
                headers.push((
                    "X-Circuit-Breaker-State".to_string(),
                    breaker.state().as_str().to_string(),
                ));
                if let Some(at) = breaker.next_attempt_at_millis() {
                    headers.push((
                        "X-Circuit-Breaker-Next-Attempt".to_string(),
                        (at / 1000).to_string(),
                    ));
                }
                return match &fallback {
                    Some(fallback) => {
                        breaker.record_fallback();
                        slot.release();
                        permit.release();
                        self.metrics.histogram(
                            "request_duration_ms",
                            started.elapsed().as_millis() as f64,
                            labels([("class", self.priorities.class_name(priority))]),
                        );
                        Ok(Protected {
                            value: fallback.as_ref()(ctx),
                            headers,
                            request_id: ctx.request_id().to_string(),
                        })
                    }
                    None => Err(GuardError::Rejected(ShieldError::CircuitOpen {
                        key: breaker.key().to_string(),
                        retry_after,
                    })),
                };
            }
        }

        screen(ctx, self.cfg.max_content_length).map_err(GuardError::Rejected)?;

        let result: Result<T, GuardError<E>> = match &breaker {
            Some(breaker) => {
                let outcome = breaker.execute(handler).await;
                headers.push((
                    "X-Circuit-Breaker-State".to_string(),
                    breaker.state().as_str().to_string(),
                ));
                if let Some(at) = breaker.next_attempt_at_millis() {
                    headers.push((
                        "X-Circuit-Breaker-Next-Attempt".to_string(),
                        (at / 1000).to_string(),
                    ));
                }
                match outcome {
                    Ok(value) => Ok(value),
                    Err(BreakerError::Open { key, retry_after }) => match &fallback {
                        Some(fallback) => {
                            breaker.record_fallback();
                            Ok(fallback(ctx))
                        }
                        None => Err(GuardError::Rejected(ShieldError::CircuitOpen {
                            key,
                            retry_after,
                        })),
                    },
                    Err(BreakerError::Timeout { elapsed }) => {
                        Err(GuardError::HandlerTimeout { elapsed })
                    }
                    Err(BreakerError::Inner(err)) => Err(GuardError::Handler(err)),
                }
            }
            None => handler().await.map_err(GuardError::Handler),
        };

        // Refund the rate limit point when the outcome is configured to
        // not count.
        if let Some(cfg) = rate_cfg {
            let refund = match &result {
                Ok(_) => cfg.skip_successful,
                Err(GuardError::Handler(_)) | Err(GuardError::HandlerTimeout { .. }) => {
                    cfg.skip_failed
                }
                Err(GuardError::Rejected(_)) => false,
            };
            if refund {
                self.rate_limiter.refund(ctx, cfg).await;
            }
        }

        // Completion hooks: release exactly once, record per-class latency.
        slot.release();
        permit.release();
        self.metrics.histogram(
            "request_duration_ms",
            started.elapsed().as_millis() as f64,
            labels([("class", self.priorities.class_name(priority))]),
        );

        result.map(|value| Protected {
            value,
            headers,
            request_id: ctx.request_id().to_string(),
        })
    }

    async fn passthrough<T, E, F, Fut>(
        &self,
        ctx: &ProtectionContext,
        handler: F,
    ) -> Result<Protected<T>, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let value = handler().await.map_err(GuardError::Handler)?;
        Ok(Protected {
            value,
            headers: vec![("X-Request-ID".to_string(), ctx.request_id().to_string())],
            request_id: ctx.request_id().to_string(),
        })
    }

    /// The fail-open boundary: log, count, allow.
    fn fail_open(&self, stage: &str, err: &dyn std::fmt::Display) {
        tracing::warn!(stage, error = %err, "infrastructure error, failing open");
        self.metrics.increment("guard_fail_open", 1, labels([("stage", stage)]));
    }
}

/// Loopback plus the RFC 1918 private ranges.
fn is_trusted_source(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

fn default_message(status: u16) -> String {
    match status {
        429 => "Too Many Requests".to_string(),
        503 => "Service Unavailable".to_string(),
        403 => "Forbidden".to_string(),
        413 => "Payload Too Large".to_string(),
        _ => "Request Rejected".to_string(),
    }
}

/// Strip risky characters and cap the length before pattern matching.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '{' | '}' | '\'' | '"'))
        .take(512)
        .collect()
}

fn suspicious_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"\.\.", "path-traversal"),
            (r"<script", "script-injection"),
            (r"(?i)union.*select", "sql-injection"),
            (r"exec\s*\(", "code-execution"),
            (r"__proto__", "prototype-pollution"),
            (r"constructor", "prototype-pollution"),
        ]
        .into_iter()
        .map(|(pattern, name)| {
            (Regex::new(pattern).expect("static pattern compiles"), name)
        })
        .collect()
    })
}

/// Security screening: reject requests whose path, user agent or sanitised
/// query values look hostile, or whose declared body is oversized.
fn screen(ctx: &ProtectionContext, max_content_length: u64) -> Result<(), ShieldError> {
    if let Some(length) = ctx.content_length() {
        if length > max_content_length {
            return Err(ShieldError::RequestTooLarge { length, max: max_content_length });
        }
    }

    let mut candidates: Vec<String> = vec![ctx.path().to_string()];
    if let Some(agent) = ctx.user_agent() {
        candidates.push(agent.to_string());
    }
    candidates.extend(ctx.query().iter().map(|(_, v)| sanitize(v)));

    for candidate in &candidates {
        for (pattern, name) in suspicious_patterns() {
            if pattern.is_match(candidate) {
                return Err(ShieldError::SuspiciousPattern { pattern: name });
            }
        }
    }
    Ok(())
}
