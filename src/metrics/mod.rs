//! Metric recording with label sets and pluggable collectors.
//!
//! Recording is local bookkeeping only: counters are atomic adds, gauges are
//! stores, histograms take a short per-series lock. Aggregation (last-minute
//! rates, percentiles) happens when a snapshot is pulled, never on the
//! request path. Collectors consume snapshots asynchronously.

use crate::clock::{Clock, SystemClock};
use hdrhistogram::Histogram;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

mod collector;

pub use collector::{LogCollector, MemoryCollector, MetricsCollector};

const SHARDS: usize = 16;
const WINDOW_BUCKETS: usize = 12;
const WINDOW_BUCKET_MILLIS: u64 = 5_000;

/// Label set identifying a series together with its name.
pub type Labels = Vec<(String, String)>;

/// Convenience constructor that sorts labels so that identical sets compare
/// equal regardless of argument order.
pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    let mut out: Labels =
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    out.sort();
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    name: String,
    labels: Labels,
}

/// Sliding one-minute window of counter increments, bucketed so stale
/// history falls off as time advances.
#[derive(Debug)]
struct RollingWindow {
    counts: [i64; WINDOW_BUCKETS],
    stamps: [u64; WINDOW_BUCKETS],
}

impl RollingWindow {
    fn new() -> Self {
        Self { counts: [0; WINDOW_BUCKETS], stamps: [0; WINDOW_BUCKETS] }
    }

    fn add(&mut self, now_millis: u64, by: i64) {
        let stamp = now_millis / WINDOW_BUCKET_MILLIS;
        let idx = (stamp as usize) % WINDOW_BUCKETS;
        if self.stamps[idx] != stamp {
            self.counts[idx] = 0;
            self.stamps[idx] = stamp;
        }
        self.counts[idx] += by;
    }

    fn sum(&self, now_millis: u64) -> i64 {
        let stamp = now_millis / WINDOW_BUCKET_MILLIS;
        let oldest_live = stamp.saturating_sub(WINDOW_BUCKETS as u64 - 1);
        self.stamps
            .iter()
            .zip(self.counts.iter())
            .filter(|(s, _)| **s >= oldest_live && **s <= stamp)
            .map(|(_, c)| *c)
            .sum()
    }
}

enum SeriesCell {
    Counter { total: AtomicI64, window: Mutex<RollingWindow> },
    Gauge { bits: AtomicU64 },
    Histogram { hist: Mutex<Histogram<u64>> },
}

/// Point-in-time view of one series, pulled by collectors.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    pub name: String,
    pub labels: Labels,
    pub kind: SnapshotKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotKind {
    Counter { total: i64, last_minute: i64 },
    Gauge { value: f64 },
    Histogram { count: u64, min: u64, max: u64, mean: f64, p50: u64, p90: u64, p99: u64 },
}

/// One observation forwarded to the out-of-band anomaly feed.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub labels: Labels,
    pub value: f64,
    pub at_millis: u64,
}

struct Inner {
    shards: [Mutex<HashMap<SeriesKey, Arc<SeriesCell>>>; SHARDS],
    clock: Arc<dyn Clock>,
    collectors: Mutex<Vec<Arc<dyn MetricsCollector>>>,
    anomaly_tx: Mutex<Option<mpsc::Sender<MetricSample>>>,
    anomaly_dropped: AtomicU64,
}

/// Cheap-to-clone handle to the metric registry.
#[derive(Clone)]
pub struct MetricsSink {
    inner: Arc<Inner>,
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsSink").finish_non_exhaustive()
    }
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
                clock,
                collectors: Mutex::new(Vec::new()),
                anomaly_tx: Mutex::new(None),
                anomaly_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Open the bounded anomaly feed and return its receiving end. Samples
    /// are dropped (and counted) rather than ever blocking a recording.
    pub fn open_anomaly_feed(&self, capacity: usize) -> mpsc::Receiver<MetricSample> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.inner.anomaly_tx.lock().expect("metrics lock poisoned") = Some(tx);
        rx
    }

    pub fn anomaly_samples_dropped(&self) -> u64 {
        self.inner.anomaly_dropped.load(Ordering::Relaxed)
    }

    pub fn register_collector(&self, collector: Arc<dyn MetricsCollector>) {
        self.inner.collectors.lock().expect("metrics lock poisoned").push(collector);
    }

    pub fn increment(&self, name: &str, by: i64, labels: Labels) {
        let now = self.inner.clock.now_millis();
        let cell = self.cell(name, labels.clone(), || SeriesCell::Counter {
            total: AtomicI64::new(0),
            window: Mutex::new(RollingWindow::new()),
        });
        if let SeriesCell::Counter { total, window } = &*cell {
            total.fetch_add(by, Ordering::Relaxed);
            window.lock().expect("metrics lock poisoned").add(now, by);
        }
        self.feed(name, labels, by as f64, now);
    }

    pub fn decrement(&self, name: &str, by: i64, labels: Labels) {
        self.increment(name, -by, labels);
    }

    pub fn gauge(&self, name: &str, value: f64, labels: Labels) {
        let now = self.inner.clock.now_millis();
        let cell = self.cell(name, labels.clone(), || SeriesCell::Gauge {
            bits: AtomicU64::new(0f64.to_bits()),
        });
        if let SeriesCell::Gauge { bits } = &*cell {
            bits.store(value.to_bits(), Ordering::Relaxed);
        }
        self.feed(name, labels, value, now);
    }

    pub fn histogram(&self, name: &str, value: f64, labels: Labels) {
        let now = self.inner.clock.now_millis();
        let cell = self.cell(name, labels.clone(), || SeriesCell::Histogram {
            hist: Mutex::new(Histogram::new(3).expect("three significant figures is valid")),
        });
        if let SeriesCell::Histogram { hist } = &*cell {
            let _ = hist
                .lock()
                .expect("metrics lock poisoned")
                .record(value.max(0.0) as u64);
        }
        self.feed(name, labels, value, now);
    }

    /// Summaries share the histogram representation; percentiles come out of
    /// the same snapshot.
    pub fn summary(&self, name: &str, value: f64, labels: Labels) {
        self.histogram(name, value, labels);
    }

    /// Start a timer; the elapsed milliseconds are recorded as a histogram
    /// when the returned guard drops.
    pub fn start_timer(&self, name: &str, labels: Labels) -> TimerGuard {
        TimerGuard {
            sink: self.clone(),
            name: name.to_string(),
            labels: Some(labels),
            started: Instant::now(),
        }
    }

    /// Materialise every live series. Sorted by name then labels so output
    /// is stable for collectors and tests.
    pub fn snapshot(&self) -> Vec<SeriesSnapshot> {
        let now = self.inner.clock.now_millis();
        let mut out = Vec::new();
        for shard in &self.inner.shards {
            let map = shard.lock().expect("metrics lock poisoned");
            for (key, cell) in map.iter() {
                let kind = match &**cell {
                    SeriesCell::Counter { total, window } => SnapshotKind::Counter {
                        total: total.load(Ordering::Relaxed),
                        last_minute: window.lock().expect("metrics lock poisoned").sum(now),
                    },
                    SeriesCell::Gauge { bits } => SnapshotKind::Gauge {
                        value: f64::from_bits(bits.load(Ordering::Relaxed)),
                    },
                    SeriesCell::Histogram { hist } => {
                        let h = hist.lock().expect("metrics lock poisoned");
                        SnapshotKind::Histogram {
                            count: h.len(),
                            min: h.min(),
                            max: h.max(),
                            mean: h.mean(),
                            p50: h.value_at_quantile(0.5),
                            p90: h.value_at_quantile(0.9),
                            p99: h.value_at_quantile(0.99),
                        }
                    }
                };
                out.push(SeriesSnapshot {
                    name: key.name.clone(),
                    labels: key.labels.clone(),
                    kind,
                });
            }
        }
        out.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
        out
    }

    /// Push one snapshot to every registered collector.
    pub async fn export_once(&self) {
        let snapshot = self.snapshot();
        let collectors: Vec<Arc<dyn MetricsCollector>> = self
            .inner
            .collectors
            .lock()
            .expect("metrics lock poisoned")
            .clone();
        for collector in collectors {
            collector.collect(&snapshot).await;
        }
    }

    fn cell<F>(&self, name: &str, labels: Labels, create: F) -> Arc<SeriesCell>
    where
        F: FnOnce() -> SeriesCell,
    {
        let key = SeriesKey { name: name.to_string(), labels };
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = &self.inner.shards[(hasher.finish() as usize) % SHARDS];
        let mut map = shard.lock().expect("metrics lock poisoned");
        map.entry(key).or_insert_with(|| Arc::new(create())).clone()
    }

    fn feed(&self, name: &str, labels: Labels, value: f64, at_millis: u64) {
        let tx = self.inner.anomaly_tx.lock().expect("metrics lock poisoned");
        if let Some(tx) = tx.as_ref() {
            let sample = MetricSample { name: name.to_string(), labels, value, at_millis };
            if tx.try_send(sample).is_err() {
                self.inner.anomaly_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Records a histogram observation of elapsed milliseconds on drop.
pub struct TimerGuard {
    sink: MetricsSink,
    name: String,
    labels: Option<Labels>,
    started: Instant,
}

impl TimerGuard {
    /// Stop explicitly, recording now instead of at drop.
    pub fn stop(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if let Some(labels) = self.labels.take() {
            let elapsed = self.started.elapsed().as_millis() as f64;
            self.sink.histogram(&self.name, elapsed, labels);
        }
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.record();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn sink_at(millis: u64) -> (MetricsSink, ManualClock) {
        let clock = ManualClock::new(millis);
        (MetricsSink::with_clock(Arc::new(clock.clone())), clock)
    }

    fn counter(snapshot: &[SeriesSnapshot], name: &str) -> (i64, i64) {
        match snapshot.iter().find(|s| s.name == name).map(|s| &s.kind) {
            Some(SnapshotKind::Counter { total, last_minute }) => (*total, *last_minute),
            other => panic!("expected counter for {}, got {:?}", name, other),
        }
    }

    #[test]
    fn identical_name_and_labels_share_a_series() {
        let (sink, _) = sink_at(0);
        sink.increment("requests", 1, labels([("route", "/a"), ("method", "GET")]));
        sink.increment("requests", 2, labels([("method", "GET"), ("route", "/a")]));
        sink.increment("requests", 5, labels([("route", "/b"), ("method", "GET")]));

        let snap = sink.snapshot();
        let series: Vec<_> = snap.iter().filter(|s| s.name == "requests").collect();
        assert_eq!(series.len(), 2);
        assert!(matches!(series[0].kind, SnapshotKind::Counter { total: 3, .. }));
        assert!(matches!(series[1].kind, SnapshotKind::Counter { total: 5, .. }));
    }

    #[test]
    fn rolling_window_forgets_old_increments() {
        let (sink, clock) = sink_at(0);
        sink.increment("hits", 10, Labels::new());
        clock.advance(30_000);
        sink.increment("hits", 5, Labels::new());

        let (total, last_minute) = counter(&sink.snapshot(), "hits");
        assert_eq!(total, 15);
        assert_eq!(last_minute, 15);

        clock.advance(45_000);
        let (total, last_minute) = counter(&sink.snapshot(), "hits");
        assert_eq!(total, 15);
        assert_eq!(last_minute, 5);

        clock.advance(60_000);
        let (_, last_minute) = counter(&sink.snapshot(), "hits");
        assert_eq!(last_minute, 0);
    }

    #[test]
    fn gauges_keep_the_last_value() {
        let (sink, _) = sink_at(0);
        sink.gauge("health", 0.5, Labels::new());
        sink.gauge("health", 0.9, Labels::new());
        match &sink.snapshot()[0].kind {
            SnapshotKind::Gauge { value } => assert!((value - 0.9).abs() < f64::EPSILON),
            other => panic!("expected gauge, got {:?}", other),
        }
    }

    #[test]
    fn histogram_percentiles_are_ordered() {
        let (sink, _) = sink_at(0);
        for v in 1..=100 {
            sink.histogram("latency", v as f64, Labels::new());
        }
        match &sink.snapshot()[0].kind {
            SnapshotKind::Histogram { count, min, p50, p90, p99, max, .. } => {
                assert_eq!(*count, 100);
                assert_eq!(*min, 1);
                assert!(p50 <= p90 && p90 <= p99 && p99 <= max);
            }
            other => panic!("expected histogram, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn anomaly_feed_receives_samples_and_drops_on_backpressure() {
        let (sink, _) = sink_at(0);
        let mut rx = sink.open_anomaly_feed(2);
        sink.increment("a", 1, Labels::new());
        sink.increment("b", 1, Labels::new());
        sink.increment("c", 1, Labels::new());

        assert_eq!(sink.anomaly_samples_dropped(), 1);
        assert_eq!(rx.recv().await.unwrap().name, "a");
        assert_eq!(rx.recv().await.unwrap().name, "b");
    }

    #[test]
    fn timer_guard_records_on_drop() {
        let (sink, _) = sink_at(0);
        {
            let _timer = sink.start_timer("op_ms", Labels::new());
        }
        match &sink.snapshot()[0].kind {
            SnapshotKind::Histogram { count, .. } => assert_eq!(*count, 1),
            other => panic!("expected histogram, got {:?}", other),
        }
    }
}
