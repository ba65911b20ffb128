//! Component configuration and per-route override merging.
//!
//! Every config is validated once, at construction. Validation failures are
//! the only fatal errors in the crate; after a [`crate::Shield`] is built the
//! pipeline fails open rather than failing the request.

use crate::context::ProtectionContext;
use crate::error::ConfigError;
use arc_swap::ArcSwap;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Live-tunable value with lock-free reads.
///
/// Reads snapshot the current value; writers replace it wholesale. Used for
/// thresholds the adaptive controllers adjust at runtime.
#[derive(Debug)]
pub struct Tunable<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for Tunable<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Tunable<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.inner.load_full();
        self.inner.store(Arc::new(f(&current)));
    }
}

/// Extracts the counter key for a request. Defaults to identity + route.
pub type KeyExtractor = Arc<dyn Fn(&ProtectionContext) -> String + Send + Sync>;

/// Extracts an explicit priority for a request, overriding header/metadata.
pub type PriorityExtractor = Arc<dyn Fn(&ProtectionContext) -> Option<i32> + Send + Sync>;

/// Supplemental health probe consulted by `CircuitBreaker::health_check`.
pub type HealthCheckFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Candidate visible to a custom shed function. A snapshot, never live state.
#[derive(Debug, Clone)]
pub struct ShedCandidate {
    pub request_id: String,
    pub priority: i32,
    pub enqueued_at_millis: u64,
}

/// Picks the index of the queued candidate to evict; `None` rejects the
/// incoming request instead. Must be side-effect free.
pub type CustomShedFn = Arc<dyn Fn(&[ShedCandidate]) -> Option<usize> + Send + Sync>;

/// Strategy applied when a bounded queue is full, and its symmetric rule for
/// choosing the next waiter on release.
#[derive(Clone, Default)]
pub enum ShedStrategy {
    /// Serve in arrival order; reject new arrivals when full.
    #[default]
    Fifo,
    /// Serve newest first; evict the oldest waiter to admit new arrivals.
    Lifo,
    /// Evict the lowest-priority waiter to make room for higher priority.
    Priority,
    /// Evict a uniformly random waiter.
    Random,
    /// Caller-provided selection over a queue snapshot.
    Custom(CustomShedFn),
}

impl fmt::Debug for ShedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fifo => f.write_str("Fifo"),
            Self::Lifo => f.write_str("Lifo"),
            Self::Priority => f.write_str("Priority"),
            Self::Random => f.write_str("Random"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Fixed-window rate limit configuration.
#[derive(Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests allowed per window. At least 1.
    pub points: u32,
    /// Window length. At least 1 second.
    pub duration: Duration,
    /// Explicit block length applied by `RateLimiter::block`.
    pub block_duration: Duration,
    pub key_extractor: Option<KeyExtractor>,
    pub custom_message: Option<String>,
    pub custom_headers: Vec<(String, String)>,
    /// Refund the point when the handler succeeds.
    pub skip_successful: bool,
    /// Refund the point when the handler fails.
    pub skip_failed: bool,
}

impl RateLimitConfig {
    pub fn new(points: u32, duration: Duration) -> Result<Self, ConfigError> {
        let cfg = Self { enabled: true, points, duration, ..Self::default() };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.points < 1 {
            return Err(ConfigError::invalid("rate_limit.points", "must be at least 1"));
        }
        if self.duration < Duration::from_secs(1) {
            return Err(ConfigError::invalid("rate_limit.duration", "must be at least 1s"));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            points: 100,
            duration: Duration::from_secs(60),
            block_duration: Duration::from_secs(300),
            key_extractor: None,
            custom_message: None,
            custom_headers: Vec::new(),
            skip_successful: false,
            skip_failed: false,
        }
    }
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("enabled", &self.enabled)
            .field("points", &self.points)
            .field("duration", &self.duration)
            .field("block_duration", &self.block_duration)
            .field("custom_extractor", &self.key_extractor.is_some())
            .finish()
    }
}

/// First-request-anchored throttle configuration.
#[derive(Clone)]
pub struct ThrottleConfig {
    pub enabled: bool,
    /// Requests allowed inside one anchored window. At least 1.
    pub limit: u32,
    /// Window length measured from the first request.
    pub ttl: Duration,
    pub key_extractor: Option<KeyExtractor>,
    /// User agents matching any of these are never throttled.
    pub ignore_user_agents: Vec<Regex>,
}

impl ThrottleConfig {
    pub fn new(limit: u32, ttl: Duration) -> Result<Self, ConfigError> {
        let cfg = Self { enabled: true, limit, ttl, ..Self::default() };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Compile and attach user-agent allowlist patterns.
    pub fn ignore_user_agents<I, S>(mut self, patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let re = Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
            self.ignore_user_agents.push(re);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit < 1 {
            return Err(ConfigError::invalid("throttle.limit", "must be at least 1"));
        }
        if self.ttl.is_zero() {
            return Err(ConfigError::invalid("throttle.ttl", "must be non-zero"));
        }
        Ok(())
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 10,
            ttl: Duration::from_secs(60),
            key_extractor: None,
            ignore_user_agents: Vec::new(),
        }
    }
}

impl fmt::Debug for ThrottleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleConfig")
            .field("enabled", &self.enabled)
            .field("limit", &self.limit)
            .field("ttl", &self.ttl)
            .field("ignore_user_agents", &self.ignore_user_agents.len())
            .finish()
    }
}

/// Circuit breaker configuration.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Handler deadline. `None` means no deadline.
    pub timeout: Option<Duration>,
    /// Error percentage in `[0, 100]` at which the breaker opens.
    pub error_threshold_percentage: f64,
    /// How long the breaker stays open before allowing a probe.
    pub reset_timeout: Duration,
    /// Span covered by the rolling statistics window.
    pub rolling_window: Duration,
    /// Number of buckets the rolling window is split into. At least 1.
    pub rolling_buckets: usize,
    /// Minimum calls inside the window before the threshold is evaluated.
    pub volume_threshold: u64,
    /// Ignore failures entirely for the first `warm_up_call_volume` calls.
    pub allow_warm_up: bool,
    pub warm_up_call_volume: u64,
    /// Supplemental probe consulted by `health_check`.
    pub health_check: Option<HealthCheckFn>,
}

impl CircuitBreakerConfig {
    pub fn new(error_threshold_percentage: f64, reset_timeout: Duration) -> Result<Self, ConfigError> {
        let cfg = Self {
            enabled: true,
            error_threshold_percentage,
            reset_timeout,
            ..Self::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.error_threshold_percentage) {
            return Err(ConfigError::invalid(
                "circuit_breaker.error_threshold_percentage",
                "must be within [0, 100]",
            ));
        }
        if self.rolling_buckets < 1 {
            return Err(ConfigError::invalid(
                "circuit_breaker.rolling_buckets",
                "must be at least 1",
            ));
        }
        if self.rolling_window.is_zero() {
            return Err(ConfigError::invalid(
                "circuit_breaker.rolling_window",
                "must be non-zero",
            ));
        }
        Ok(())
    }

    pub(crate) fn bucket_millis(&self) -> u64 {
        (self.rolling_window.as_millis() as u64 / self.rolling_buckets as u64).max(1)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: Some(Duration::from_secs(10)),
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_secs(30),
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            volume_threshold: 10,
            allow_warm_up: false,
            warm_up_call_volume: 10,
            health_check: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .field("error_threshold_percentage", &self.error_threshold_percentage)
            .field("reset_timeout", &self.reset_timeout)
            .field("rolling_window", &self.rolling_window)
            .field("rolling_buckets", &self.rolling_buckets)
            .field("volume_threshold", &self.volume_threshold)
            .finish()
    }
}

/// Global overload controller configuration.
#[derive(Clone, Debug)]
pub struct OverloadConfig {
    pub enabled: bool,
    /// System-wide concurrent slot budget.
    pub max_concurrent: usize,
    /// Bounded queue of admitted-but-waiting requests.
    pub max_queue_size: usize,
    /// Deadline for a queued request.
    pub queue_timeout: Duration,
    pub shed_strategy: ShedStrategy,
    /// How often the health indicator is polled.
    pub health_poll_interval: Duration,
    /// When set, the effective threshold follows the health score.
    pub adaptive_threshold: bool,
}

impl OverloadConfig {
    pub fn new(max_concurrent: usize, max_queue_size: usize) -> Result<Self, ConfigError> {
        let cfg = Self { enabled: true, max_concurrent, max_queue_size, ..Self::default() };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("overload.max_concurrent", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for OverloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent: 256,
            max_queue_size: 512,
            queue_timeout: Duration::from_secs(5),
            shed_strategy: ShedStrategy::Fifo,
            health_poll_interval: Duration::from_secs(5),
            adaptive_threshold: false,
        }
    }
}

/// One priority class. Higher `value` means more important.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PriorityLevel {
    pub value: i32,
    pub name: &'static str,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub timeout: Duration,
}

impl PriorityLevel {
    pub fn new(value: i32, name: &'static str, max_concurrent: usize) -> Self {
        Self {
            value,
            name,
            max_concurrent,
            max_queue_size: max_concurrent * 2,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Adaptive per-class concurrency adjustment bounds.
#[derive(Clone, Debug)]
pub struct AdaptivePriorityConfig {
    pub interval: Duration,
    pub min_concurrent: usize,
    pub max_concurrent: usize,
}

impl Default for AdaptivePriorityConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            min_concurrent: 4,
            max_concurrent: 4096,
        }
    }
}

/// Priority manager configuration.
#[derive(Clone)]
pub struct PriorityConfig {
    pub enabled: bool,
    /// Totally ordered by `value`; duplicates rejected at validation.
    pub levels: Vec<PriorityLevel>,
    pub default_priority: i32,
    /// Header consulted when no extractor claims the request.
    pub priority_header: String,
    pub extractor: Option<PriorityExtractor>,
    /// A class lagging behind `fairness_threshold ×` the mean wait is boosted.
    pub fairness_threshold: f64,
    pub adaptive: Option<AdaptivePriorityConfig>,
}

impl PriorityConfig {
    /// Default classes: critical=10, high=8, normal=5, low=3, background=1.
    pub fn default_levels() -> Vec<PriorityLevel> {
        vec![
            PriorityLevel::new(10, "critical", 64),
            PriorityLevel::new(8, "high", 48),
            PriorityLevel::new(5, "normal", 32),
            PriorityLevel::new(3, "low", 16),
            PriorityLevel::new(1, "background", 8),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.levels.is_empty() {
            return Err(ConfigError::invalid("priority.levels", "at least one level required"));
        }
        let mut values: Vec<i32> = self.levels.iter().map(|l| l.value).collect();
        values.sort_unstable();
        values.dedup();
        if values.len() != self.levels.len() {
            return Err(ConfigError::invalid("priority.levels", "duplicate level values"));
        }
        if self.levels.iter().any(|l| l.max_concurrent == 0) {
            return Err(ConfigError::invalid(
                "priority.levels",
                "max_concurrent must be at least 1",
            ));
        }
        if self.fairness_threshold <= 1.0 {
            return Err(ConfigError::invalid(
                "priority.fairness_threshold",
                "must be greater than 1",
            ));
        }
        Ok(())
    }
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            levels: Self::default_levels(),
            default_priority: 5,
            priority_header: "x-request-priority".to_string(),
            extractor: None,
            fairness_threshold: 3.0,
            adaptive: None,
        }
    }
}

impl fmt::Debug for PriorityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityConfig")
            .field("enabled", &self.enabled)
            .field("levels", &self.levels)
            .field("default_priority", &self.default_priority)
            .field("fairness_threshold", &self.fairness_threshold)
            .finish()
    }
}

/// Guard-level configuration.
#[derive(Clone, Debug)]
pub struct GuardConfig {
    /// Global switch. When false every request is allowed untouched.
    pub enabled: bool,
    /// Declared body size above which requests are rejected with 413.
    pub max_content_length: u64,
    /// Exact paths trusted sources may reach without protection.
    pub trusted_paths: Vec<String>,
    /// Verbose rejection bodies (suppressed in production).
    pub verbose_rejections: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_content_length: 10 * 1024 * 1024,
            trusted_paths: vec![
                "/health".to_string(),
                "/metrics".to_string(),
                "/status".to_string(),
            ],
            verbose_rejections: std::env::var("NODE_ENV")
                .map(|v| v != "production")
                .unwrap_or(true),
        }
    }
}

/// Distributed sync configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Stable node id; generated from hostname + pid when absent.
    pub node_id: Option<String>,
    pub sync_interval: Duration,
    /// Logical channel name embedded in broadcast keys.
    pub channel: String,
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval < Duration::from_secs(1) {
            return Err(ConfigError::invalid("sync.sync_interval", "must be at least 1s"));
        }
        Ok(())
    }

    /// A node is considered dead after six missed intervals.
    pub fn dead_node_threshold(&self) -> Duration {
        self.sync_interval * 6
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            sync_interval: Duration::from_secs(10),
            channel: "shield".to_string(),
        }
    }
}

/// Per-route overrides registered by the integration layer.
///
/// `None` fields inherit from the layer below; merge order is global
/// defaults ← class-level ← method-level.
#[derive(Clone, Debug, Default)]
pub struct RouteOverrides {
    pub bypass: Option<bool>,
    pub priority: Option<i32>,
    pub rate_limit: Option<RateLimitConfig>,
    pub throttle: Option<ThrottleConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl RouteOverrides {
    pub fn bypass() -> Self {
        Self { bypass: Some(true), ..Self::default() }
    }

    /// Overlay `self` on top of `base`, field by field.
    pub fn merge_over(&self, base: &EffectiveProtection) -> EffectiveProtection {
        EffectiveProtection {
            bypass: self.bypass.unwrap_or(base.bypass),
            priority: self.priority.or(base.priority),
            rate_limit: self.rate_limit.clone().or_else(|| base.rate_limit.clone()),
            throttle: self.throttle.clone().or_else(|| base.throttle.clone()),
            circuit_breaker: self
                .circuit_breaker
                .clone()
                .or_else(|| base.circuit_breaker.clone()),
        }
    }
}

/// The pre-merged protection settings for one route. The guard indexes these
/// by handler id; nothing is reflected at request time.
#[derive(Clone, Debug, Default)]
pub struct EffectiveProtection {
    pub bypass: bool,
    pub priority: Option<i32>,
    pub rate_limit: Option<RateLimitConfig>,
    pub throttle: Option<ThrottleConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}
