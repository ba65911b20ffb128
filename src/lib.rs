#![forbid(unsafe_code)]

//! # Shield
//!
//! In-process request protection for async Rust services: rate limiting,
//! throttling, priority-aware overload shedding, and circuit breaking,
//! composed behind a single guard.
//!
//! ## Features
//!
//! - **Fixed-window rate limiting** over a pluggable key-value store
//! - **First-request-anchored throttling** with batched store writes
//! - **Priority classes** with per-class pools, queues, and fairness
//! - **Overload shedding** (FIFO/LIFO/priority/random/custom strategies)
//! - **Circuit breakers** with rolling-window statistics and fallbacks
//! - **Distributed membership** over the shared store, with leader election
//!
//! ## Quick Start
//!
//! ```rust
//! use std::convert::Infallible;
//! use std::time::Duration;
//! use shield::{ProtectionContext, RateLimitConfig, Shield, SystemClock};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shield = Shield::builder()
//!         .rate_limit(RateLimitConfig::new(100, Duration::from_secs(60))?)
//!         .build()?;
//!     shield.start();
//!
//!     let guard = shield.guard();
//!     let ctx = ProtectionContext::builder("GET", "/orders")
//!         .ip("198.51.100.7".parse()?)
//!         .build(&SystemClock);
//!
//!     let protected = guard
//!         .protect(&ctx, || async { Ok::<_, Infallible>("handled") })
//!         .await?;
//!     assert_eq!(protected.value, "handled");
//!
//!     shield.shutdown(Duration::from_secs(30)).await;
//!     Ok(())
//! }
//! ```

mod anomaly;
mod circuit_breaker;
mod circuit_breaker_registry;
mod clock;
mod config;
mod context;
mod error;
mod guard;
mod metrics;
mod middleware;
mod overload;
pub mod presets;
mod priority;
mod rate_limit;
mod shield;
mod store;
mod sync;
mod throttle;

// Re-exports
pub use anomaly::{AnomalyDetector, AnomalyFeed, ThresholdAdjustment};
pub use circuit_breaker::{
    BreakerError, BreakerEvent, BreakerListener, BreakerSnapshot, BreakerState, CircuitBreaker,
};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AdaptivePriorityConfig, CircuitBreakerConfig, CustomShedFn, EffectiveProtection, GuardConfig,
    KeyExtractor, OverloadConfig, PriorityConfig, PriorityExtractor, PriorityLevel,
    RateLimitConfig, RouteOverrides, ShedCandidate, ShedStrategy, SyncConfig, ThrottleConfig,
    Tunable,
};
pub use context::{ContextBuilder, ProtectionContext};
pub use error::{ConfigError, GuardError, ShieldError, StoreError};
pub use guard::{FallbackFn, Guard, Protected, Rejection};
pub use metrics::{
    labels, Labels, LogCollector, MemoryCollector, MetricSample, MetricsCollector, MetricsSink,
    SeriesSnapshot, SnapshotKind, TimerGuard,
};
pub use middleware::{ProtectedRequest, ProtectedResponse, ShieldLayer, ShieldService};
pub use overload::{
    FairnessSource, HealthIndicator, OverloadController, OverloadPermit, OverloadStatus,
};
pub use priority::{PriorityClassStats, PriorityManager, PrioritySlot};
pub use rate_limit::{BlockRecord, RateLimitOutcome, RateLimiter};
pub use shield::{Shield, ShieldBuilder};
pub use store::{MemoryStore, Store, TTL_MISSING, TTL_NONE};
pub use sync::{DistributedSync, NodeInfo, NodeMetadata, SyncListener, SyncMessage, SyncMessageKind};
pub use throttle::{ThrottleOutcome, ThrottleRecord, Throttler};

pub mod prelude;
