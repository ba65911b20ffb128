//! Priority classes with per-class concurrency pools and bounded queues.
//!
//! Each class runs its own small pool: a mutex over the counters plus a
//! notifier for waiters. There is no lock shared across classes, so a
//! saturated background class cannot contend with critical traffic.

use crate::clock::Clock;
use crate::config::{PriorityConfig, PriorityLevel};
use crate::context::ProtectionContext;
use crate::error::ShieldError;
use crate::metrics::{labels, MetricsSink};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Longest single wait before re-checking for a free slot.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Counters {
    current: usize,
    queued: usize,
    processed: u64,
    rejected: u64,
    last_processed_millis: u64,
    /// Runtime ceiling; the adaptive controller moves it within bounds.
    max_concurrent: usize,
}

#[derive(Debug)]
struct ClassState {
    level: PriorityLevel,
    counters: Mutex<Counters>,
    released: Notify,
}

/// Snapshot of one class. `processed + rejected + current + queued` equals
/// the number of requests the class has ever observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityClassStats {
    pub value: i32,
    pub name: &'static str,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub current: usize,
    pub queued: usize,
    pub processed: u64,
    pub rejected: u64,
    pub last_processed_millis: u64,
}

pub struct PriorityManager {
    classes: BTreeMap<i32, Arc<ClassState>>,
    cfg: PriorityConfig,
    clock: Arc<dyn Clock>,
    metrics: MetricsSink,
}

impl std::fmt::Debug for PriorityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityManager")
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PriorityManager {
    pub fn new(cfg: PriorityConfig, metrics: MetricsSink, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        let classes = cfg
            .levels
            .iter()
            .map(|level| {
                let state = ClassState {
                    level: level.clone(),
                    counters: Mutex::new(Counters {
                        current: 0,
                        queued: 0,
                        processed: 0,
                        rejected: 0,
                        last_processed_millis: now,
                        max_concurrent: level.max_concurrent,
                    }),
                    released: Notify::new(),
                };
                (level.value, Arc::new(state))
            })
            .collect();
        Self { classes, cfg, clock, metrics }
    }

    /// Resolve a request's priority: explicit extractor, then the priority
    /// header, then context metadata, then the route's declared class, then
    /// the default. Unknown values coerce to the nearest defined class.
    pub fn extract(&self, ctx: &ProtectionContext, route_priority: Option<i32>) -> i32 {
        let raw = self
            .cfg
            .extractor
            .as_ref()
            .and_then(|extractor| extractor(ctx))
            .or_else(|| {
                ctx.header(&self.cfg.priority_header).and_then(|v| v.trim().parse().ok())
            })
            .or_else(|| ctx.priority())
            .or_else(|| ctx.metadata().get("priority").and_then(|v| v.parse().ok()))
            .or(route_priority)
            .unwrap_or(self.cfg.default_priority);
        self.coerce(raw)
    }

    /// Nearest defined class by absolute distance; ties go upward.
    pub fn coerce(&self, value: i32) -> i32 {
        if self.classes.contains_key(&value) {
            return value;
        }
        self.classes
            .keys()
            .copied()
            .min_by_key(|candidate| {
                let distance = (i64::from(*candidate) - i64::from(value)).abs();
                (distance, -i64::from(*candidate))
            })
            .expect("validated config has at least one level")
    }

    /// A class can accept work unless both its pool and queue are full.
    pub fn can_accept(&self, priority: i32) -> bool {
        let class = self.class(priority);
        let counters = class.counters.lock().expect("priority counters poisoned");
        counters.current < counters.max_concurrent
            || counters.queued < class.level.max_queue_size
    }

    pub fn timeout_for(&self, priority: i32) -> Duration {
        self.class(priority).level.timeout
    }

    pub fn class_name(&self, priority: i32) -> &'static str {
        self.class(priority).level.name
    }

    /// Take a slot immediately if the pool has room.
    pub fn try_acquire(self: &Arc<Self>, priority: i32) -> Option<PrioritySlot> {
        let class = self.class(priority).clone();
        let mut counters = class.counters.lock().expect("priority counters poisoned");
        if counters.current < counters.max_concurrent {
            counters.current += 1;
            drop(counters);
            Some(PrioritySlot {
                class,
                clock: self.clock.clone(),
                released: AtomicBool::new(false),
            })
        } else {
            None
        }
    }

    /// Take a slot, queueing up to the class timeout. Each individual wait
    /// is capped at five seconds before re-checking.
    pub async fn acquire(self: &Arc<Self>, priority: i32) -> Result<PrioritySlot, ShieldError> {
        let class = self.class(priority).clone();
        let timeout = class.level.timeout;
        let deadline = self.clock.now_millis() + timeout.as_millis() as u64;

        loop {
            if let Some(slot) = self.try_acquire(priority) {
                return Ok(slot);
            }

            {
                let mut counters = class.counters.lock().expect("priority counters poisoned");
                if counters.queued >= class.level.max_queue_size {
                    counters.rejected += 1;
                    drop(counters);
                    self.metrics.increment(
                        "priority_rejected",
                        1,
                        labels([("class", class.level.name)]),
                    );
                    return Err(ShieldError::PriorityQueueFull {
                        class: priority,
                        retry_after: timeout,
                    });
                }
                counters.queued += 1;
            }

            let remaining = deadline.saturating_sub(self.clock.now_millis());
            let wait = Duration::from_millis(remaining).min(MAX_WAIT_SLICE);
            let _ = tokio::time::timeout(wait, class.released.notified()).await;

            {
                let mut counters = class.counters.lock().expect("priority counters poisoned");
                counters.queued -= 1;
                if remaining == 0 || self.clock.now_millis() >= deadline {
                    counters.rejected += 1;
                    drop(counters);
                    self.metrics.increment(
                        "priority_timeout",
                        1,
                        labels([("class", class.level.name)]),
                    );
                    return Err(ShieldError::PriorityQueueFull {
                        class: priority,
                        retry_after: timeout,
                    });
                }
            }
        }
    }

    /// The class most starved past the fairness threshold, if any.
    ///
    /// A class whose time since last service exceeds `fairness_threshold ×`
    /// the cross-class mean is boosted in queue ordering regardless of its
    /// nominal priority.
    pub fn starved_class(&self) -> Option<i32> {
        let now = self.clock.now_millis();
        let waits: Vec<(i32, u64)> = self
            .classes
            .iter()
            .map(|(value, class)| {
                let counters = class.counters.lock().expect("priority counters poisoned");
                (*value, now.saturating_sub(counters.last_processed_millis))
            })
            .collect();
        let mean = waits.iter().map(|(_, w)| *w).sum::<u64>() as f64 / waits.len() as f64;
        if mean == 0.0 {
            return None;
        }
        waits
            .into_iter()
            .filter(|(_, wait)| *wait as f64 > self.cfg.fairness_threshold * mean)
            .max_by_key(|(_, wait)| *wait)
            .map(|(value, _)| value)
    }

    pub fn stats(&self) -> Vec<PriorityClassStats> {
        self.classes
            .values()
            .map(|class| {
                let counters = class.counters.lock().expect("priority counters poisoned");
                PriorityClassStats {
                    value: class.level.value,
                    name: class.level.name,
                    max_concurrent: counters.max_concurrent,
                    max_queue_size: class.level.max_queue_size,
                    current: counters.current,
                    queued: counters.queued,
                    processed: counters.processed,
                    rejected: counters.rejected,
                    last_processed_millis: counters.last_processed_millis,
                }
            })
            .collect()
    }

    /// Total in-flight requests across every class.
    pub fn total_in_flight(&self) -> usize {
        self.classes
            .values()
            .map(|c| c.counters.lock().expect("priority counters poisoned").current)
            .sum()
    }

    /// One adaptive pass: grow hot classes by 20 %, shrink cold ones still
    /// holding more than 20 in-flight requests by 20 %, inside the
    /// configured bounds. Every change is recorded.
    pub fn adjust_once(&self) {
        let Some(adaptive) = &self.cfg.adaptive else {
            return;
        };
        for class in self.classes.values() {
            let mut counters = class.counters.lock().expect("priority counters poisoned");
            let utilization = counters.current as f64 / counters.max_concurrent as f64;
            let before = counters.max_concurrent;
            if utilization > 0.9 {
                counters.max_concurrent =
                    (((before as f64) * 1.2).ceil() as usize).min(adaptive.max_concurrent);
            } else if utilization < 0.3 && counters.current > 20 {
                counters.max_concurrent =
                    (((before as f64) * 0.8).floor() as usize).max(adaptive.min_concurrent);
            }
            if counters.max_concurrent != before {
                let after = counters.max_concurrent;
                drop(counters);
                self.metrics.gauge(
                    "priority_max_concurrent",
                    after as f64,
                    labels([("class", class.level.name)]),
                );
                tracing::info!(
                    class = class.level.name,
                    before,
                    after,
                    "adaptive priority adjustment"
                );
            }
        }
    }

    /// Adaptive loop. Runs until shutdown is signalled.
    pub async fn run_adaptive(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(adaptive) = self.cfg.adaptive.clone() else {
            return;
        };
        let mut interval = tokio::time::interval(adaptive.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.adjust_once(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn class(&self, priority: i32) -> &Arc<ClassState> {
        self.classes
            .get(&priority)
            .or_else(|| self.classes.get(&self.coerce(priority)))
            .expect("validated config has at least one level")
    }
}

/// A held concurrency slot. Released exactly once: explicitly by the guard's
/// completion hook, or by drop on cancellation.
pub struct PrioritySlot {
    class: Arc<ClassState>,
    clock: Arc<dyn Clock>,
    released: AtomicBool,
}

impl PrioritySlot {
    pub fn priority(&self) -> i32 {
        self.class.level.value
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut counters = self.class.counters.lock().expect("priority counters poisoned");
        counters.current = counters.current.saturating_sub(1);
        counters.processed += 1;
        counters.last_processed_millis = self.clock.now_millis();
        drop(counters);
        self.class.released.notify_one();
    }
}

impl Drop for PrioritySlot {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PrioritySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrioritySlot")
            .field("class", &self.class.level.name)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}
