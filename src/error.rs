//! Error types for the protection pipeline.

use std::fmt;
use std::time::Duration;

/// Rejection reasons that are allowed to reach the HTTP layer.
///
/// Everything else (store failures, configuration mistakes at runtime,
/// unexpected panics in extractors) is caught at the guard boundary and
/// converted into an allow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShieldError {
    /// Per-client quota for the current fixed window is exhausted.
    RateLimitExceeded { limit: u32, retry_after: Duration },
    /// The first-request-anchored throttle cap was exceeded.
    ThrottleLimitExceeded { limit: u32, retry_after: Duration },
    /// The global overload queue is saturated.
    OverloadQueueFull { queued: usize, max_queue: usize },
    /// The request waited in the overload queue past its deadline.
    OverloadTimeout { waited: Duration },
    /// The overload queue was cleared, typically during shutdown.
    QueueCleared,
    /// The downstream protected by this breaker is presumed unhealthy.
    CircuitOpen { key: String, retry_after: Duration },
    /// The request's priority class has no free slot and a full queue.
    PriorityQueueFull { class: i32, retry_after: Duration },
    /// The request matched a suspicious path/user-agent/query pattern.
    SuspiciousPattern { pattern: &'static str },
    /// Declared content length exceeds the configured maximum.
    RequestTooLarge { length: u64, max: u64 },
    /// The caller's address carries an explicit block record.
    Blocked { reason: String, retry_after: Duration },
}

impl ShieldError {
    /// HTTP status the guard maps this rejection to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimitExceeded { .. } | Self::ThrottleLimitExceeded { .. } => 429,
            Self::OverloadQueueFull { .. }
            | Self::OverloadTimeout { .. }
            | Self::QueueCleared
            | Self::CircuitOpen { .. }
            | Self::PriorityQueueFull { .. } => 503,
            Self::SuspiciousPattern { .. } => 403,
            Self::RequestTooLarge { .. } => 413,
            Self::Blocked { .. } => 429,
        }
    }

    /// Retry hint in whole seconds, when one makes sense.
    pub fn retry_after(&self) -> Option<u64> {
        let d = match self {
            Self::RateLimitExceeded { retry_after, .. }
            | Self::ThrottleLimitExceeded { retry_after, .. }
            | Self::CircuitOpen { retry_after, .. }
            | Self::PriorityQueueFull { retry_after, .. }
            | Self::Blocked { retry_after, .. } => *retry_after,
            _ => return None,
        };
        Some(d.as_secs().max(1))
    }

    /// Rejection family used in the response body's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } | Self::Blocked { .. } => "rate-limit",
            Self::ThrottleLimitExceeded { .. } => "throttle",
            Self::CircuitOpen { .. } => "circuit-breaker",
            Self::OverloadQueueFull { .. }
            | Self::OverloadTimeout { .. }
            | Self::QueueCleared
            | Self::PriorityQueueFull { .. } => "overload",
            Self::SuspiciousPattern { .. } | Self::RequestTooLarge { .. } => "security",
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. } | Self::Blocked { .. })
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, Self::ThrottleLimitExceeded { .. })
    }

    pub fn is_overload(&self) -> bool {
        matches!(
            self,
            Self::OverloadQueueFull { .. } | Self::OverloadTimeout { .. } | Self::QueueCleared
        )
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_security(&self) -> bool {
        matches!(self, Self::SuspiciousPattern { .. } | Self::RequestTooLarge { .. })
    }
}

impl fmt::Display for ShieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimitExceeded { limit, retry_after } => {
                write!(f, "rate limit of {} exceeded, retry in {:?}", limit, retry_after)
            }
            Self::ThrottleLimitExceeded { limit, retry_after } => {
                write!(f, "throttle limit of {} exceeded, retry in {:?}", limit, retry_after)
            }
            Self::OverloadQueueFull { queued, max_queue } => {
                write!(f, "overload queue full ({} queued, max {})", queued, max_queue)
            }
            Self::OverloadTimeout { waited } => {
                write!(f, "request timed out in overload queue after {:?}", waited)
            }
            Self::QueueCleared => write!(f, "overload queue cleared"),
            Self::CircuitOpen { key, retry_after } => {
                write!(f, "circuit '{}' open, next attempt in {:?}", key, retry_after)
            }
            Self::PriorityQueueFull { class, retry_after } => {
                write!(f, "priority class {} saturated, retry in {:?}", class, retry_after)
            }
            Self::SuspiciousPattern { pattern } => {
                write!(f, "request matched suspicious pattern {}", pattern)
            }
            Self::RequestTooLarge { length, max } => {
                write!(f, "request of {} bytes exceeds maximum {}", length, max)
            }
            Self::Blocked { reason, retry_after } => {
                write!(f, "caller blocked ({}), retry in {:?}", reason, retry_after)
            }
        }
    }
}

impl std::error::Error for ShieldError {}

/// Infrastructure failures from the key-value store.
///
/// These never surface to callers of the guard; they are converted into an
/// allow with a metric and a warning.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The backend reported a failure.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A stored value had an unexpected shape for the requested operation.
    #[error("wrong value type at key '{key}': {expected} expected")]
    WrongType { key: String, expected: &'static str },
    /// (De)serialization of a stored record failed.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration mistakes caught at construction time. Fatal only there.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("invalid user-agent pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue { field, reason: reason.into() }
    }
}

/// Outcome of running a protected handler through the guard.
#[derive(Debug)]
pub enum GuardError<E> {
    /// The pipeline rejected the request before or instead of the handler.
    Rejected(ShieldError),
    /// The handler itself failed; the failure was recorded by the breaker.
    Handler(E),
    /// The handler exceeded the circuit breaker's deadline.
    HandlerTimeout { elapsed: Duration },
}

impl<E> GuardError<E> {
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn rejection(&self) -> Option<&ShieldError> {
        match self {
            Self::Rejected(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_handler_error(self) -> Option<E> {
        match self {
            Self::Handler(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "{}", e),
            Self::Handler(e) => write!(f, "{}", e),
            Self::HandlerTimeout { elapsed } => {
                write!(f, "handler timed out after {:?}", elapsed)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rejected(e) => Some(e),
            Self::Handler(e) => Some(e),
            Self::HandlerTimeout { .. } => None,
        }
    }
}
