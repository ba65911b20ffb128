//! Collector fanout for metric snapshots.

use super::{SeriesSnapshot, SnapshotKind};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Consumes metric snapshots pulled off the hot path.
///
/// Collectors run from the export task, never from request handling, so an
/// implementation may do real I/O.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn collect(&self, snapshot: &[SeriesSnapshot]);

    fn name(&self) -> &'static str {
        "collector"
    }
}

/// Logs a compact summary of each snapshot through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCollector;

#[async_trait]
impl MetricsCollector for LogCollector {
    async fn collect(&self, snapshot: &[SeriesSnapshot]) {
        let counters = snapshot
            .iter()
            .filter(|s| matches!(s.kind, SnapshotKind::Counter { .. }))
            .count();
        let gauges = snapshot
            .iter()
            .filter(|s| matches!(s.kind, SnapshotKind::Gauge { .. }))
            .count();
        let histograms = snapshot.len() - counters - gauges;
        tracing::info!(series = snapshot.len(), counters, gauges, histograms, "metrics export");
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Retains every snapshot in memory. Intended for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryCollector {
    snapshots: Arc<Mutex<Vec<Vec<SeriesSnapshot>>>>,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<Vec<SeriesSnapshot>> {
        self.snapshots.lock().expect("collector lock poisoned").last().cloned()
    }

    pub fn exports(&self) -> usize {
        self.snapshots.lock().expect("collector lock poisoned").len()
    }
}

#[async_trait]
impl MetricsCollector for MemoryCollector {
    async fn collect(&self, snapshot: &[SeriesSnapshot]) {
        self.snapshots
            .lock()
            .expect("collector lock poisoned")
            .push(snapshot.to_vec());
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
