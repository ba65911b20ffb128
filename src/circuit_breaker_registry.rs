//! Registry of named circuit breakers.
//!
//! Breakers are created on first use and live with the process. Reads
//! dominate writes, so the map sits behind an `RwLock`; state transitions
//! take each breaker's own inner lock.

use crate::circuit_breaker::{BreakerListener, BreakerSnapshot, BreakerState, CircuitBreaker};
use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::metrics::MetricsSink;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    defaults: CircuitBreakerConfig,
    listeners: Arc<Vec<Arc<dyn BreakerListener>>>,
    metrics: MetricsSink,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self
            .inner
            .read()
            .expect("breaker registry poisoned")
            .keys()
            .cloned()
            .collect();
        f.debug_struct("CircuitBreakerRegistry").field("keys", &keys).finish()
    }
}

impl CircuitBreakerRegistry {
    pub fn new(
        defaults: CircuitBreakerConfig,
        listeners: Vec<Arc<dyn BreakerListener>>,
        metrics: MetricsSink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            defaults,
            listeners: Arc::new(listeners),
            metrics,
            clock,
        }
    }

    /// Breaker for `key`, created from `cfg` (or the registry defaults) on
    /// first use. A config passed for an existing key is ignored; the
    /// instance keeps the config it was born with.
    pub fn get_or_create(
        &self,
        key: &str,
        cfg: Option<&CircuitBreakerConfig>,
    ) -> Arc<CircuitBreaker> {
        {
            let map = self.inner.read().expect("breaker registry poisoned");
            if let Some(breaker) = map.get(key) {
                return breaker.clone();
            }
        }
        let mut map = self.inner.write().expect("breaker registry poisoned");
        map.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    key,
                    cfg.unwrap_or(&self.defaults).clone(),
                    self.listeners.clone(),
                    self.metrics.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.read().expect("breaker registry poisoned").get(key).cloned()
    }

    pub fn reset(&self, key: &str) -> bool {
        match self.get(key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Disable every breaker. Used during graceful shutdown so probes do
    /// not start against draining downstreams.
    pub fn disable_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let map = self.inner.read().expect("breaker registry poisoned");
            map.values().cloned().collect()
        };
        for breaker in breakers {
            breaker.disable();
        }
    }

    /// `(key, state)` pairs, sorted by key.
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let map = self.inner.read().expect("breaker registry poisoned");
        let mut entries: Vec<(String, BreakerState)> =
            map.iter().map(|(k, b)| (k.clone(), b.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Full counter snapshots, sorted by key.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let map = self.inner.read().expect("breaker registry poisoned");
        let mut snapshots: Vec<BreakerSnapshot> =
            map.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("breaker registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
