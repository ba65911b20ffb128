//! Per-key circuit breaking with rolling-window failure statistics.
//!
//! The window is a fixed ring of buckets; each call lands in the bucket for
//! `floor(now / bucket_duration) mod buckets`, and stale buckets are cleared
//! before any aggregation. Listeners are invoked after the state lock is
//! released, never under it.

use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::error::ShieldError;
use crate::metrics::{labels, MetricsSink};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Breaker states. `Disabled` is terminal passthrough, orthogonal to the
/// closed/open/half-open cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
    Disabled,
}

impl BreakerState {
    /// Gauge encoding: 0 closed, 0.5 half-open, 1 open.
    fn gauge_value(self) -> f64 {
        match self {
            BreakerState::Closed | BreakerState::Disabled => 0.0,
            BreakerState::HalfOpen => 0.5,
            BreakerState::Open => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
            BreakerState::Disabled => "disabled",
        }
    }
}

/// Failure of a call routed through a breaker.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker is open; the handler never ran.
    Open { key: String, retry_after: Duration },
    /// The handler exceeded the configured deadline.
    Timeout { elapsed: Duration },
    /// The handler itself failed.
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Events fanned out to registered listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerEvent {
    StateChanged { key: String, from: BreakerState, to: BreakerState },
    CallRejected { key: String },
    FallbackInvoked { key: String },
}

/// Synchronous listener list entry. Keep implementations fast; they run on
/// the request path, though outside the breaker lock.
pub trait BreakerListener: Send + Sync {
    fn on_event(&self, event: &BreakerEvent);
}

/// Point-in-time counters for one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub fires: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejects: u64,
    pub fallbacks: u64,
    pub error_percentage: f64,
    pub latency_mean_millis: f64,
    pub next_attempt_epoch_millis: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    stamp: u64,
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejects: u64,
}

#[derive(Debug)]
struct Core {
    state: BreakerState,
    buckets: Vec<Bucket>,
    next_attempt_at_millis: u64,
    probe_in_flight: bool,
    lifetime_calls: u64,
    fires: u64,
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejects: u64,
    fallbacks: u64,
    latency_sum_millis: u64,
    latency_count: u64,
}

enum Admission {
    Permitted { probe: bool },
    Rejected { retry_after: Duration },
    Passthrough,
}

enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// One breaker instance, owned by the registry under its key.
pub struct CircuitBreaker {
    key: String,
    cfg: CircuitBreakerConfig,
    core: Mutex<Core>,
    listeners: Arc<Vec<Arc<dyn BreakerListener>>>,
    clock: Arc<dyn Clock>,
    metrics: MetricsSink,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        key: impl Into<String>,
        cfg: CircuitBreakerConfig,
        listeners: Arc<Vec<Arc<dyn BreakerListener>>>,
        metrics: MetricsSink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let buckets = vec![Bucket::default(); cfg.rolling_buckets];
        Self {
            key: key.into(),
            cfg,
            core: Mutex::new(Core {
                state: BreakerState::Closed,
                buckets,
                next_attempt_at_millis: 0,
                probe_in_flight: false,
                lifetime_calls: 0,
                fires: 0,
                successes: 0,
                failures: 0,
                timeouts: 0,
                rejects: 0,
                fallbacks: 0,
                latency_sum_millis: 0,
                latency_count: 0,
            }),
            listeners,
            metrics,
            clock,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> BreakerState {
        self.core.lock().expect("breaker lock poisoned").state
    }

    /// Run `handler` through the breaker, classifying the outcome into the
    /// current rolling bucket and evaluating a state transition.
    pub async fn execute<T, E, F, Fut>(&self, handler: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.try_acquire() {
            Admission::Passthrough => {
                return handler().await.map_err(BreakerError::Inner);
            }
            Admission::Rejected { retry_after } => {
                return Err(BreakerError::Open { key: self.key.clone(), retry_after });
            }
            Admission::Permitted { probe: _ } => {}
        }

        let started = Instant::now();
        let (outcome, result) = match self.cfg.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, handler()).await {
                Ok(Ok(value)) => (Outcome::Success, Ok(value)),
                Ok(Err(err)) => (Outcome::Failure, Err(BreakerError::Inner(err))),
                Err(_) => (
                    Outcome::Timeout,
                    Err(BreakerError::Timeout { elapsed: started.elapsed() }),
                ),
            },
            None => match handler().await {
                Ok(value) => (Outcome::Success, Ok(value)),
                Err(err) => (Outcome::Failure, Err(BreakerError::Inner(err))),
            },
        };
        self.record(outcome, started.elapsed());
        result
    }

    /// Admission check for orchestration: `Some(retry_after)` when a call
    /// right now would be rejected (open before the next attempt, or a
    /// probe already in flight), recording the rejection. Never consumes
    /// the half-open probe slot and never transitions state; a due probe
    /// still happens through [`CircuitBreaker::execute`].
    pub fn check_rejected(&self) -> Option<Duration> {
        let now = self.clock.now_millis();
        let rejection = {
            let mut core = self.core.lock().expect("breaker lock poisoned");
            match core.state {
                BreakerState::Open if now < core.next_attempt_at_millis => {
                    core.rejects += 1;
                    self.bucket(&mut core, now).rejects += 1;
                    Some(Duration::from_millis(
                        core.next_attempt_at_millis.saturating_sub(now),
                    ))
                }
                BreakerState::HalfOpen if core.probe_in_flight => {
                    core.rejects += 1;
                    self.bucket(&mut core, now).rejects += 1;
                    Some(self.cfg.reset_timeout)
                }
                _ => None,
            }
        };
        if rejection.is_some() {
            self.emit(&BreakerEvent::CallRejected { key: self.key.clone() });
            self.metrics.increment(
                "circuit_breaker_rejects",
                1,
                labels([("key", self.key.as_str())]),
            );
        }
        rejection
    }

    /// False when the breaker is open; otherwise defers to the configured
    /// supplemental health check.
    pub fn health_check(&self) -> bool {
        if self.state() == BreakerState::Open {
            return false;
        }
        self.cfg.health_check.as_ref().map_or(true, |check| check())
    }

    /// Record a fallback invocation made on this breaker's behalf.
    pub fn record_fallback(&self) {
        {
            let mut core = self.core.lock().expect("breaker lock poisoned");
            core.fallbacks += 1;
        }
        self.metrics.increment(
            "circuit_breaker_fallbacks",
            1,
            labels([("key", self.key.as_str())]),
        );
        self.emit(&BreakerEvent::FallbackInvoked { key: self.key.clone() });
    }

    pub fn force_open(&self) {
        self.transition_with(|core, now| {
            core.next_attempt_at_millis = now + self.cfg.reset_timeout.as_millis() as u64;
            BreakerState::Open
        });
    }

    pub fn force_close(&self) {
        self.transition_with(|_, _| BreakerState::Closed);
    }

    pub fn disable(&self) {
        self.transition_with(|_, _| BreakerState::Disabled);
    }

    pub fn enable(&self) {
        self.transition_with(|_, _| BreakerState::Closed);
    }

    /// Back to closed with empty statistics, as if freshly created.
    pub fn reset(&self) {
        let event = {
            let mut core = self.core.lock().expect("breaker lock poisoned");
            let from = core.state;
            for bucket in &mut core.buckets {
                *bucket = Bucket::default();
            }
            core.probe_in_flight = false;
            core.next_attempt_at_millis = 0;
            core.lifetime_calls = 0;
            self.set_state(&mut core, BreakerState::Closed);
            (from != BreakerState::Closed).then(|| BreakerEvent::StateChanged {
                key: self.key.clone(),
                from,
                to: BreakerState::Closed,
            })
        };
        if let Some(event) = event {
            self.emit(&event);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now_millis();
        let mut core = self.core.lock().expect("breaker lock poisoned");
        let (successes, failures) = self.window_totals(&mut core, now);
        let denominator = successes + failures;
        let error_percentage = if denominator == 0 {
            0.0
        } else {
            failures as f64 / denominator as f64 * 100.0
        };
        BreakerSnapshot {
            key: self.key.clone(),
            state: core.state,
            fires: core.fires,
            successes: core.successes,
            failures: core.failures,
            timeouts: core.timeouts,
            rejects: core.rejects,
            fallbacks: core.fallbacks,
            error_percentage,
            latency_mean_millis: if core.latency_count == 0 {
                0.0
            } else {
                core.latency_sum_millis as f64 / core.latency_count as f64
            },
            next_attempt_epoch_millis: (core.state == BreakerState::Open)
                .then_some(core.next_attempt_at_millis),
        }
    }

    /// Epoch milliseconds of the next allowed probe while open.
    pub fn next_attempt_at_millis(&self) -> Option<u64> {
        let core = self.core.lock().expect("breaker lock poisoned");
        (core.state == BreakerState::Open).then_some(core.next_attempt_at_millis)
    }

    fn try_acquire(&self) -> Admission {
        let now = self.clock.now_millis();
        let (admission, event) = {
            let mut core = self.core.lock().expect("breaker lock poisoned");
            match core.state {
                BreakerState::Disabled => (Admission::Passthrough, None),
                BreakerState::Closed => {
                    core.fires += 1;
                    core.lifetime_calls += 1;
                    (Admission::Permitted { probe: false }, None)
                }
                BreakerState::Open if now >= core.next_attempt_at_millis => {
                    let from = core.state;
                    self.set_state(&mut core, BreakerState::HalfOpen);
                    core.probe_in_flight = true;
                    core.fires += 1;
                    core.lifetime_calls += 1;
                    (
                        Admission::Permitted { probe: true },
                        Some(BreakerEvent::StateChanged {
                            key: self.key.clone(),
                            from,
                            to: BreakerState::HalfOpen,
                        }),
                    )
                }
                BreakerState::Open => {
                    core.rejects += 1;
                    self.bucket(&mut core, now).rejects += 1;
                    let retry_after = Duration::from_millis(
                        core.next_attempt_at_millis.saturating_sub(now),
                    );
                    (
                        Admission::Rejected { retry_after },
                        Some(BreakerEvent::CallRejected { key: self.key.clone() }),
                    )
                }
                BreakerState::HalfOpen if core.probe_in_flight => {
                    // Exactly one probe may be in flight; the rest behave as
                    // if the breaker were still open.
                    core.rejects += 1;
                    self.bucket(&mut core, now).rejects += 1;
                    (
                        Admission::Rejected { retry_after: self.cfg.reset_timeout },
                        Some(BreakerEvent::CallRejected { key: self.key.clone() }),
                    )
                }
                BreakerState::HalfOpen => {
                    core.probe_in_flight = true;
                    core.fires += 1;
                    core.lifetime_calls += 1;
                    (Admission::Permitted { probe: true }, None)
                }
            }
        };

        if let Some(event) = &event {
            self.emit(event);
        }
        if matches!(admission, Admission::Rejected { .. }) {
            self.metrics.increment(
                "circuit_breaker_rejects",
                1,
                labels([("key", self.key.as_str())]),
            );
        }
        admission
    }

    fn record(&self, outcome: Outcome, elapsed: Duration) {
        let now = self.clock.now_millis();
        let elapsed_millis = elapsed.as_millis() as u64;
        let event = {
            let mut core = self.core.lock().expect("breaker lock poisoned");
            core.latency_sum_millis += elapsed_millis;
            core.latency_count += 1;
            match outcome {
                Outcome::Success => {
                    core.successes += 1;
                    self.bucket(&mut core, now).successes += 1;
                }
                Outcome::Failure => {
                    core.failures += 1;
                    self.bucket(&mut core, now).failures += 1;
                }
                Outcome::Timeout => {
                    core.timeouts += 1;
                    self.bucket(&mut core, now).timeouts += 1;
                }
            }

            match core.state {
                BreakerState::HalfOpen => {
                    core.probe_in_flight = false;
                    let from = core.state;
                    let to = match outcome {
                        Outcome::Success => BreakerState::Closed,
                        // A failed probe re-opens and pushes the next attempt out.
                        _ => {
                            core.next_attempt_at_millis =
                                now + self.cfg.reset_timeout.as_millis() as u64;
                            BreakerState::Open
                        }
                    };
                    if to == BreakerState::Closed {
                        for bucket in &mut core.buckets {
                            *bucket = Bucket::default();
                        }
                    }
                    self.set_state(&mut core, to);
                    Some(BreakerEvent::StateChanged { key: self.key.clone(), from, to })
                }
                BreakerState::Closed => self.evaluate(&mut core, now),
                _ => None,
            }
        };

        if let Some(event) = &event {
            self.emit(event);
        }
        self.metrics.increment(
            match outcome {
                Outcome::Success => "circuit_breaker_successes",
                Outcome::Failure => "circuit_breaker_failures",
                Outcome::Timeout => "circuit_breaker_timeouts",
            },
            1,
            labels([("key", self.key.as_str())]),
        );
    }

    /// Threshold evaluation while closed. Returns the transition event when
    /// the breaker opens.
    fn evaluate(&self, core: &mut Core, now: u64) -> Option<BreakerEvent> {
        if self.cfg.allow_warm_up && core.lifetime_calls <= self.cfg.warm_up_call_volume {
            return None;
        }
        let (successes, failures) = self.window_totals(core, now);
        let total = successes + failures;
        if total < self.cfg.volume_threshold {
            return None;
        }
        let error_percentage = failures as f64 / total as f64 * 100.0;
        if error_percentage < self.cfg.error_threshold_percentage {
            return None;
        }

        let from = core.state;
        core.next_attempt_at_millis = now + self.cfg.reset_timeout.as_millis() as u64;
        self.set_state(core, BreakerState::Open);
        tracing::warn!(
            key = %self.key,
            error_percentage,
            total,
            "circuit breaker opened"
        );
        Some(BreakerEvent::StateChanged { key: self.key.clone(), from, to: BreakerState::Open })
    }

    /// Current bucket for `now`, cleared first if its stamp is stale.
    fn bucket<'a>(&self, core: &'a mut Core, now: u64) -> &'a mut Bucket {
        let bucket_millis = self.cfg.bucket_millis();
        let stamp = now / bucket_millis;
        let idx = (stamp as usize) % self.cfg.rolling_buckets;
        let bucket = &mut core.buckets[idx];
        if bucket.stamp != stamp {
            *bucket = Bucket { stamp, ..Bucket::default() };
        }
        bucket
    }

    /// Live-window success/failure totals, clearing stale buckets first.
    fn window_totals(&self, core: &mut Core, now: u64) -> (u64, u64) {
        let bucket_millis = self.cfg.bucket_millis();
        let current_stamp = now / bucket_millis;
        let oldest_live = current_stamp.saturating_sub(self.cfg.rolling_buckets as u64 - 1);
        let mut successes = 0;
        let mut failures = 0;
        for bucket in &mut core.buckets {
            if bucket.stamp < oldest_live {
                *bucket = Bucket::default();
                continue;
            }
            successes += bucket.successes;
            failures += bucket.failures;
        }
        (successes, failures)
    }

    fn set_state(&self, core: &mut Core, to: BreakerState) {
        if core.state == to {
            return;
        }
        core.state = to;
        self.metrics.gauge(
            "circuit_breaker_state",
            to.gauge_value(),
            labels([("key", self.key.as_str())]),
        );
    }

    fn transition_with<F>(&self, f: F)
    where
        F: FnOnce(&mut Core, u64) -> BreakerState,
    {
        let now = self.clock.now_millis();
        let event = {
            let mut core = self.core.lock().expect("breaker lock poisoned");
            let from = core.state;
            let to = f(&mut core, now);
            core.probe_in_flight = false;
            self.set_state(&mut core, to);
            (from != to).then(|| BreakerEvent::StateChanged {
                key: self.key.clone(),
                from,
                to,
            })
        };
        if let Some(event) = event {
            self.emit(&event);
        }
    }

    fn emit(&self, event: &BreakerEvent) {
        for listener in self.listeners.iter() {
            listener.on_event(event);
        }
        if let BreakerEvent::StateChanged { from, to, .. } = event {
            tracing::info!(key = %self.key, from = from.as_str(), to = to.as_str(), "breaker state transition");
        }
    }
}

/// Convert an open-breaker failure into the pipeline rejection.
impl<E> BreakerError<E> {
    pub fn into_shield_error(self) -> Option<ShieldError> {
        match self {
            Self::Open { key, retry_after } => {
                Some(ShieldError::CircuitOpen { key, retry_after })
            }
            _ => None,
        }
    }
}
