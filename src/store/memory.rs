//! Single-process store backed by sharded hash maps.

use super::{glob_match, Store, TTL_MISSING, TTL_NONE};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SHARDS: usize = 16;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_millis: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now_millis: u64) -> bool {
        matches!(self.expires_at_millis, Some(at) if now_millis >= at)
    }
}

/// In-memory [`Store`] implementation.
///
/// Sixteen mutexed shards keep counter contention local; increments are
/// atomic because each key lives in exactly one shard. Expiry is lazy on
/// access, with [`MemoryStore::purge_expired`] available for sweeps.
#[derive(Clone)]
pub struct MemoryStore {
    shards: Arc<[Mutex<HashMap<String, Entry>>; SHARDS]>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shards: Arc::new(std::array::from_fn(|_| Mutex::new(HashMap::new()))),
            clock,
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    fn expires_at(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|ttl| self.clock.now_millis() + ttl.as_millis() as u64)
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut purged = 0;
        for shard in self.shards.iter() {
            let mut map = shard.lock().expect("store shard poisoned");
            let before = map.len();
            map.retain(|_, entry| !entry.is_expired(now));
            purged += before - map.len();
        }
        purged
    }

    /// Drop everything. Used by tests and shutdown.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().expect("store shard poisoned").clear();
        }
    }

    /// Live (unexpired) entry count.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.shards
            .iter()
            .map(|s| {
                s.lock()
                    .expect("store shard poisoned")
                    .values()
                    .filter(|e| !e.is_expired(now))
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").field("entries", &self.len()).finish()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.shard(key).lock().expect("store shard poisoned");
        match map.get(key) {
            Some(entry) if entry.is_expired(now) => {
                map.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at_millis = self.expires_at(ttl);
        let mut map = self.shard(key).lock().expect("store shard poisoned");
        map.insert(key.to_string(), Entry { value, expires_at_millis });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.shard(key).lock().expect("store shard poisoned");
        match map.remove(key) {
            Some(entry) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.shard(key).lock().expect("store shard poisoned");
        let entry = match map.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => entry,
            _ => {
                map.insert(
                    key.to_string(),
                    Entry { value: Value::from(0i64), expires_at_millis: None },
                );
                map.get_mut(key).expect("entry just inserted")
            }
        };
        let current = entry.value.as_i64().ok_or_else(|| StoreError::WrongType {
            key: key.to_string(),
            expected: "integer",
        })?;
        let next = current + by;
        entry.value = Value::from(next);
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let expires_at_millis = Some(now + ttl.as_millis() as u64);
        let mut map = self.shard(key).lock().expect("store shard poisoned");
        match map.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at_millis = expires_at_millis;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let map = self.shard(key).lock().expect("store shard poisoned");
        match map.get(key) {
            Some(entry) if entry.is_expired(now) => Ok(TTL_MISSING),
            Some(Entry { expires_at_millis: Some(at), .. }) => {
                Ok(((at - now) as f64 / 1000.0).ceil() as i64)
            }
            Some(Entry { expires_at_millis: None, .. }) => Ok(TTL_NONE),
            None => Ok(TTL_MISSING),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut keys = Vec::new();
        for shard in self.shards.iter() {
            let map = shard.lock().expect("store shard poisoned");
            keys.extend(
                map.iter()
                    .filter(|(k, e)| !e.is_expired(now) && glob_match(pattern, k))
                    .map(|(k, _)| k.clone()),
            );
        }
        keys.sort_unstable();
        Ok(keys)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Value>>, StoreError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn mset(
        &self,
        pairs: &[(String, Value)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        for (key, value) in pairs {
            self.set(key, value.clone(), ttl).await?;
        }
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let lock_key = format!("lock:{}", key);
        let mut map = self.shard(&lock_key).lock().expect("store shard poisoned");
        match map.get(&lock_key) {
            Some(entry) if !entry.is_expired(now) => Ok(false),
            _ => {
                map.insert(
                    lock_key,
                    Entry {
                        value: Value::from(1i64),
                        expires_at_millis: Some(now + ttl.as_millis() as u64),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str) -> Result<(), StoreError> {
        let lock_key = format!("lock:{}", key);
        self.delete(&lock_key).await?;
        Ok(())
    }
}
