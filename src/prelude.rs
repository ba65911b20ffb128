//! Convenience re-exports for the common path.
//!
//! ```rust
//! use shield::prelude::*;
//! ```

pub use crate::config::{
    CircuitBreakerConfig, GuardConfig, OverloadConfig, PriorityConfig, PriorityLevel,
    RateLimitConfig, RouteOverrides, ShedStrategy, SyncConfig, ThrottleConfig,
};
pub use crate::context::ProtectionContext;
pub use crate::error::{GuardError, ShieldError};
pub use crate::guard::{Guard, Protected, Rejection};
pub use crate::metrics::MetricsSink;
pub use crate::middleware::{ProtectedRequest, ProtectedResponse, ShieldLayer};
pub use crate::shield::{Shield, ShieldBuilder};
pub use crate::store::{MemoryStore, Store};
