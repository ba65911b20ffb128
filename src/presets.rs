//! Production-ready protection presets.
//!
//! Pre-configured [`ShieldBuilder`]s for common deployment shapes, so the
//! defaults encode working production numbers instead of every service
//! re-deriving them.
//!
//! ## Available Presets
//!
//! - [`public_api`]: internet-facing APIs (rate limit, throttle, overload
//!   shedding, circuit breaker)
//! - [`internal_service`]: trusted east-west traffic (overload + breaker,
//!   no per-caller quotas)
//! - [`edge_gateway`]: high-fanout ingress (tight quotas, priority-aware
//!   shedding, adaptive thresholds)
//!
//! Every preset returns a builder, so any knob can still be overridden
//! before `build()`.

use crate::config::{
    CircuitBreakerConfig, OverloadConfig, PriorityConfig, RateLimitConfig, ShedStrategy,
    ThrottleConfig,
};
use crate::error::ConfigError;
use crate::shield::ShieldBuilder;
use std::time::Duration;

const PUBLIC_API_POINTS: u32 = 300;
const PUBLIC_API_WINDOW_SECS: u64 = 60;
const PUBLIC_API_THROTTLE_LIMIT: u32 = 30;
const PUBLIC_API_THROTTLE_TTL_SECS: u64 = 10;
const PUBLIC_API_MAX_CONCURRENT: usize = 256;

const INTERNAL_MAX_CONCURRENT: usize = 512;
const INTERNAL_BREAKER_RESET_SECS: u64 = 30;

const EDGE_POINTS: u32 = 100;
const EDGE_WINDOW_SECS: u64 = 60;
const EDGE_MAX_CONCURRENT: usize = 1024;
const EDGE_QUEUE_SIZE: usize = 2048;

/// Internet-facing API protection.
///
/// Per-caller quotas on two time scales, a global concurrency budget with a
/// FIFO queue, and a breaker in front of the handlers.
pub fn public_api() -> Result<ShieldBuilder, ConfigError> {
    Ok(ShieldBuilder::new()
        .rate_limit(RateLimitConfig::new(
            PUBLIC_API_POINTS,
            Duration::from_secs(PUBLIC_API_WINDOW_SECS),
        )?)
        .throttle(ThrottleConfig::new(
            PUBLIC_API_THROTTLE_LIMIT,
            Duration::from_secs(PUBLIC_API_THROTTLE_TTL_SECS),
        )?)
        .overload(OverloadConfig {
            enabled: true,
            max_concurrent: PUBLIC_API_MAX_CONCURRENT,
            max_queue_size: PUBLIC_API_MAX_CONCURRENT * 2,
            queue_timeout: Duration::from_secs(5),
            shed_strategy: ShedStrategy::Fifo,
            ..OverloadConfig::default()
        })
        .circuit_breaker(CircuitBreakerConfig {
            enabled: true,
            timeout: Some(Duration::from_secs(10)),
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_secs(30),
            volume_threshold: 20,
            ..CircuitBreakerConfig::default()
        }))
}

/// Trusted east-west traffic.
///
/// No per-caller quotas; the concern is resource exhaustion and sick
/// downstreams, so only the overload controller and breakers are armed.
pub fn internal_service() -> Result<ShieldBuilder, ConfigError> {
    Ok(ShieldBuilder::new()
        .overload(OverloadConfig {
            enabled: true,
            max_concurrent: INTERNAL_MAX_CONCURRENT,
            max_queue_size: INTERNAL_MAX_CONCURRENT,
            queue_timeout: Duration::from_secs(2),
            ..OverloadConfig::default()
        })
        .circuit_breaker(CircuitBreakerConfig {
            enabled: true,
            timeout: Some(Duration::from_secs(5)),
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_secs(INTERNAL_BREAKER_RESET_SECS),
            allow_warm_up: true,
            warm_up_call_volume: 50,
            ..CircuitBreakerConfig::default()
        }))
}

/// High-fanout ingress.
///
/// Tight per-caller quotas, a deep priority-shedding queue so critical
/// traffic survives saturation, and a health-driven adaptive threshold.
pub fn edge_gateway() -> Result<ShieldBuilder, ConfigError> {
    Ok(ShieldBuilder::new()
        .rate_limit(RateLimitConfig::new(
            EDGE_POINTS,
            Duration::from_secs(EDGE_WINDOW_SECS),
        )?)
        .priority(PriorityConfig { enabled: true, ..PriorityConfig::default() })
        .overload(OverloadConfig {
            enabled: true,
            max_concurrent: EDGE_MAX_CONCURRENT,
            max_queue_size: EDGE_QUEUE_SIZE,
            queue_timeout: Duration::from_secs(3),
            shed_strategy: ShedStrategy::Priority,
            adaptive_threshold: true,
            ..OverloadConfig::default()
        })
        .circuit_breaker(CircuitBreakerConfig {
            enabled: true,
            timeout: Some(Duration::from_secs(15)),
            error_threshold_percentage: 60.0,
            reset_timeout: Duration::from_secs(60),
            volume_threshold: 50,
            ..CircuitBreakerConfig::default()
        }))
}
