//! System-wide overload protection: a bounded pool of concurrent slots with
//! a shedding queue in front of it.
//!
//! Queued requests suspend on a oneshot waker. A released slot is handed to
//! the next waiter chosen by the shed strategy's symmetric rule, with
//! starved-class fairness taking precedence when a fairness source is wired.

use crate::clock::Clock;
use crate::config::{OverloadConfig, ShedCandidate, ShedStrategy, Tunable};
use crate::error::ShieldError;
use crate::metrics::{Labels, MetricsSink};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Reports backend health as a score in `[0, 1]`.
#[async_trait]
pub trait HealthIndicator: Send + Sync {
    async fn health_score(&self) -> Result<f64, Box<dyn std::error::Error + Send + Sync>>;
}

/// Hands the release path the priority class currently starved past the
/// fairness threshold, if any.
pub type FairnessSource = Arc<dyn Fn() -> Option<i32> + Send + Sync>;

struct Waiter {
    id: u64,
    request_id: String,
    priority: i32,
    enqueued_at_millis: u64,
    tx: oneshot::Sender<Result<(), ShieldError>>,
}

#[derive(Default)]
struct QueueState {
    current: usize,
    queue: Vec<Waiter>,
    next_waiter_id: u64,
}

struct Inner {
    cfg: OverloadConfig,
    state: Mutex<QueueState>,
    effective_threshold: Tunable<usize>,
    health_bits: AtomicU64,
    fairness: Mutex<Option<FairnessSource>>,
    clock: Arc<dyn Clock>,
    metrics: MetricsSink,
}

/// Point-in-time controller state.
#[derive(Debug, Clone, PartialEq)]
pub struct OverloadStatus {
    pub current: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub effective_threshold: usize,
    pub health_score: f64,
}

#[derive(Clone)]
pub struct OverloadController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OverloadController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("OverloadController")
            .field("current", &status.current)
            .field("queued", &status.queued)
            .field("effective_threshold", &status.effective_threshold)
            .finish()
    }
}

impl OverloadController {
    pub fn new(cfg: OverloadConfig, metrics: MetricsSink, clock: Arc<dyn Clock>) -> Self {
        let effective_threshold = Tunable::new(cfg.max_concurrent);
        Self {
            inner: Arc::new(Inner {
                cfg,
                state: Mutex::new(QueueState::default()),
                effective_threshold,
                health_bits: AtomicU64::new(1f64.to_bits()),
                fairness: Mutex::new(None),
                clock,
                metrics,
            }),
        }
    }

    /// Wire the starved-class hint consulted on release.
    pub fn set_fairness_source(&self, source: FairnessSource) {
        *self.inner.fairness.lock().expect("overload lock poisoned") = Some(source);
    }

    /// Handle to the live threshold, for adaptive consumers.
    pub fn threshold_handle(&self) -> Tunable<usize> {
        self.inner.effective_threshold.clone()
    }

    /// Admit, queue, or shed this request.
    pub async fn acquire(
        &self,
        request_id: &str,
        priority: i32,
    ) -> Result<OverloadPermit, ShieldError> {
        if !self.inner.cfg.enabled {
            return Ok(OverloadPermit { inner: None, released: AtomicBool::new(true) });
        }

        let rx = {
            let mut state = self.inner.state.lock().expect("overload lock poisoned");
            let threshold = (*self.inner.effective_threshold.get()).max(1);

            if state.current < threshold {
                state.current += 1;
                return Ok(self.permit());
            }

            if state.queue.len() >= self.inner.cfg.max_queue_size {
                match self.shed_for(&mut state, priority) {
                    Some(victim) => {
                        let _ = victim.tx.send(Err(ShieldError::OverloadQueueFull {
                            queued: self.inner.cfg.max_queue_size,
                            max_queue: self.inner.cfg.max_queue_size,
                        }));
                        self.inner.metrics.increment("overload_shed", 1, Labels::new());
                    }
                    None => {
                        let queued = state.queue.len();
                        drop(state);
                        self.inner.metrics.increment("overload_rejected", 1, Labels::new());
                        return Err(ShieldError::OverloadQueueFull {
                            queued,
                            max_queue: self.inner.cfg.max_queue_size,
                        });
                    }
                }
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.queue.push(Waiter {
                id,
                request_id: request_id.to_string(),
                priority,
                enqueued_at_millis: self.inner.clock.now_millis(),
                tx,
            });
            self.inner.metrics.increment("overload_queued", 1, Labels::new());
            (id, rx)
        };
        let (waiter_id, rx) = rx;

        match tokio::time::timeout(self.inner.cfg.queue_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(self.permit()),
            Ok(Ok(Err(err))) => Err(err),
            // Sender dropped without an answer; treat as a cleared queue.
            Ok(Err(_)) => Err(ShieldError::QueueCleared),
            Err(_) => self.handle_wait_timeout(waiter_id),
        }
    }

    /// Give the held slot back, admitting the next waiter if one exists.
    fn release_slot(inner: &Arc<Inner>) {
        let mut state = inner.state.lock().expect("overload lock poisoned");
        loop {
            let Some(idx) = Self::next_waiter_index(inner, &state) else {
                state.current = state.current.saturating_sub(1);
                return;
            };
            let waiter = state.queue.remove(idx);
            // The slot transfers to the waiter; `current` stays put unless
            // the waiter is already gone.
            if waiter.tx.send(Ok(())).is_ok() {
                return;
            }
        }
    }

    /// Reject every queued waiter. Used during graceful shutdown.
    pub fn clear_queue(&self) {
        let drained: Vec<Waiter> = {
            let mut state = self.inner.state.lock().expect("overload lock poisoned");
            state.queue.drain(..).collect()
        };
        let cleared = drained.len();
        for waiter in drained {
            let _ = waiter.tx.send(Err(ShieldError::QueueCleared));
        }
        if cleared > 0 {
            self.inner.metrics.increment("overload_queue_cleared", cleared as i64, Labels::new());
            tracing::info!(cleared, "overload queue cleared");
        }
    }

    /// Force the slot counter down by up to `n`, admitting waiters into the
    /// freed capacity.
    pub fn force_release(&self, n: usize) {
        let mut state = self.inner.state.lock().expect("overload lock poisoned");
        state.current = state.current.saturating_sub(n);
        let threshold = (*self.inner.effective_threshold.get()).max(1);
        while state.current < threshold {
            let Some(idx) = Self::next_waiter_index(&self.inner, &state) else {
                break;
            };
            let waiter = state.queue.remove(idx);
            if waiter.tx.send(Ok(())).is_ok() {
                state.current += 1;
            }
        }
    }

    pub fn status(&self) -> OverloadStatus {
        let state = self.inner.state.lock().expect("overload lock poisoned");
        OverloadStatus {
            current: state.current,
            queued: state.queue.len(),
            max_concurrent: self.inner.cfg.max_concurrent,
            effective_threshold: *self.inner.effective_threshold.get(),
            health_score: f64::from_bits(self.inner.health_bits.load(Ordering::Relaxed)),
        }
    }

    /// One health evaluation: indicator score when wired (errors count as
    /// 0.5), otherwise `1 − utilisation`. With adaptive thresholds on, the
    /// effective threshold follows the score.
    pub async fn poll_health_once(&self, indicator: Option<&dyn HealthIndicator>) {
        let score = match indicator {
            Some(indicator) => match indicator.health_score().await {
                Ok(score) => score.clamp(0.0, 1.0),
                Err(err) => {
                    tracing::warn!(error = %err, "health indicator failed");
                    0.5
                }
            },
            None => {
                let state = self.inner.state.lock().expect("overload lock poisoned");
                1.0 - state.current as f64 / self.inner.cfg.max_concurrent as f64
            }
        };
        self.inner.health_bits.store(score.to_bits(), Ordering::Relaxed);
        self.inner.metrics.gauge("overload_health_score", score, Labels::new());

        if self.inner.cfg.adaptive_threshold {
            let threshold =
                ((self.inner.cfg.max_concurrent as f64 * score).round() as usize).max(1);
            self.inner.effective_threshold.set(threshold);
            self.inner.metrics.gauge(
                "overload_effective_threshold",
                threshold as f64,
                Labels::new(),
            );
        }
    }

    /// Health polling loop. Runs until shutdown is signalled.
    pub async fn run_health(
        self,
        indicator: Option<Arc<dyn HealthIndicator>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.inner.cfg.health_poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_health_once(indicator.as_deref()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn permit(&self) -> OverloadPermit {
        OverloadPermit {
            inner: Some(self.inner.clone()),
            released: AtomicBool::new(false),
        }
    }

    fn handle_wait_timeout(&self, waiter_id: u64) -> Result<OverloadPermit, ShieldError> {
        let mut state = self.inner.state.lock().expect("overload lock poisoned");
        if let Some(idx) = state.queue.iter().position(|w| w.id == waiter_id) {
            state.queue.remove(idx);
            drop(state);
            self.inner.metrics.increment("overload_timeout", 1, Labels::new());
            return Err(ShieldError::OverloadTimeout {
                waited: self.inner.cfg.queue_timeout,
            });
        }
        // Lost the race: a releaser already handed us the slot.
        drop(state);
        Ok(self.permit())
    }

    /// Pick the queued victim to evict for an arrival of `priority`, or
    /// `None` to reject the arrival itself.
    fn shed_for(&self, state: &mut QueueState, priority: i32) -> Option<Waiter> {
        let idx = match &self.inner.cfg.shed_strategy {
            ShedStrategy::Fifo => None,
            ShedStrategy::Lifo => Self::oldest_index(&state.queue),
            ShedStrategy::Priority => {
                let idx = Self::lowest_priority_index(&state.queue)?;
                (state.queue[idx].priority < priority).then_some(idx)
            }
            ShedStrategy::Random => {
                (!state.queue.is_empty())
                    .then(|| rand::rng().random_range(0..state.queue.len()))
            }
            ShedStrategy::Custom(select) => {
                let snapshot: Vec<ShedCandidate> = state
                    .queue
                    .iter()
                    .map(|w| ShedCandidate {
                        request_id: w.request_id.clone(),
                        priority: w.priority,
                        enqueued_at_millis: w.enqueued_at_millis,
                    })
                    .collect();
                select(&snapshot).filter(|idx| *idx < state.queue.len())
            }
        };
        idx.map(|idx| state.queue.remove(idx))
    }

    /// Symmetric rule for release-time selection: FIFO head, LIFO tail,
    /// PRIORITY highest class, RANDOM uniform. A starved class reported by
    /// the fairness source outranks the nominal rule.
    fn next_waiter_index(inner: &Arc<Inner>, state: &QueueState) -> Option<usize> {
        if state.queue.is_empty() {
            return None;
        }

        let starved = inner
            .fairness
            .lock()
            .expect("overload lock poisoned")
            .as_ref()
            .and_then(|source| source());
        if let Some(starved) = starved {
            let boosted = state
                .queue
                .iter()
                .enumerate()
                .filter(|(_, w)| w.priority == starved)
                .min_by_key(|(_, w)| w.enqueued_at_millis)
                .map(|(idx, _)| idx);
            if boosted.is_some() {
                return boosted;
            }
        }

        match &inner.cfg.shed_strategy {
            ShedStrategy::Fifo | ShedStrategy::Custom(_) => Self::oldest_index(&state.queue),
            ShedStrategy::Lifo => state
                .queue
                .iter()
                .enumerate()
                .max_by_key(|(_, w)| w.enqueued_at_millis)
                .map(|(idx, _)| idx),
            ShedStrategy::Priority => state
                .queue
                .iter()
                .enumerate()
                .max_by_key(|(idx, w)| (w.priority, std::cmp::Reverse(*idx)))
                .map(|(idx, _)| idx),
            ShedStrategy::Random => Some(rand::rng().random_range(0..state.queue.len())),
        }
    }

    fn oldest_index(queue: &[Waiter]) -> Option<usize> {
        queue
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.enqueued_at_millis)
            .map(|(idx, _)| idx)
    }

    fn lowest_priority_index(queue: &[Waiter]) -> Option<usize> {
        queue
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| (w.priority, std::cmp::Reverse(w.enqueued_at_millis)))
            .map(|(idx, _)| idx)
    }
}

/// A held overload slot. Released exactly once; drop covers cancellation.
pub struct OverloadPermit {
    inner: Option<Arc<Inner>>,
    released: AtomicBool,
}

impl OverloadPermit {
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = &self.inner {
            OverloadController::release_slot(inner);
        }
    }
}

impl Drop for OverloadPermit {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for OverloadPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverloadPermit")
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}
