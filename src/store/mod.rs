//! Key-value storage contract consumed by the protection pipeline.
//!
//! The pipeline only ever talks to this trait. Counter cells, throttle
//! records, block records and node heartbeats all live behind it, so a
//! remote cache can replace [`MemoryStore`] without touching any component.

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

mod memory;

pub use memory::MemoryStore;

/// TTL answer for a key that does not exist, mirroring cache semantics.
pub const TTL_MISSING: i64 = -2;
/// TTL answer for a key with no expiry set.
pub const TTL_NONE: i64 = -1;

/// Asynchronous key-value store with TTLs, atomic increments and glob scan.
///
/// `incr_by` must be atomic under concurrency. Backends that cannot provide
/// that natively must serialise through [`Store::try_lock`] keyed on the
/// counter.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Set `key` to `value`, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically add `by` to the integer at `key`, creating it at 0 first.
    /// Returns the post-increment value.
    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, StoreError>;

    /// Attach or replace a TTL on an existing key. Returns false when the
    /// key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining TTL in whole seconds; [`TTL_NONE`] when unset,
    /// [`TTL_MISSING`] when the key does not exist.
    async fn ttl(&self, key: &str) -> Result<i64, StoreError>;

    /// Keys matching `pattern`, where `*` matches any run of characters.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Value>>, StoreError>;

    async fn mset(
        &self,
        pairs: &[(String, Value)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Best-effort advisory lock. Backends without native locking may keep
    /// the defaults, which grant every request.
    async fn try_lock(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn unlock(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Glob match where `*` matches any (possibly empty) run of characters.
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == candidate;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !candidate.starts_with(first)
        || !candidate.ends_with(last)
        || candidate.len() < first.len() + last.len()
    {
        return false;
    }

    // Middle literals must appear in order inside the unanchored span.
    let mut rest = &candidate[first.len()..candidate.len() - last.len()];
    for mid in &parts[1..parts.len() - 1] {
        if mid.is_empty() {
            continue;
        }
        match rest.find(mid) {
            Some(idx) => rest = &rest[idx + mid.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_any_run() {
        assert!(glob_match("node:*", "node:a1"));
        assert!(glob_match("node:*", "node:"));
        assert!(!glob_match("node:*", "sync:a1"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("sync:*:n1", "sync:metrics:n1"));
        assert!(!glob_match("sync:*:n1", "sync:metrics:n2"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("a*b", "aXbb"));
        assert!(glob_match("rate_limit:*:1700000000", "rate_limit:ip:1.2.3.4:1700000000"));
        assert!(!glob_match("a*b", "a"));
    }
}
