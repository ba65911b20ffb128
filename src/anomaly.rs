//! Out-of-band anomaly consumption.
//!
//! The detection algorithm itself lives outside this crate; what is fixed
//! here is the consumer contract: samples arrive on a bounded channel fed by
//! [`crate::metrics::MetricsSink`], and a detector may answer with threshold
//! adjustments. Nothing on the request path ever waits for this loop.

use crate::config::Tunable;
use crate::metrics::{labels, MetricSample, MetricsSink};
use tokio::sync::{mpsc, watch};

/// A multiplicative adjustment suggested by a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdAdjustment {
    /// Factor applied to the current threshold, e.g. `0.5` to halve it.
    pub scale: f64,
    pub reason: String,
}

/// Consumes metric samples and occasionally suggests an adjustment.
pub trait AnomalyDetector: Send + Sync {
    fn observe(&self, sample: &MetricSample) -> Option<ThresholdAdjustment>;
}

/// Drives a detector from the sink's sample channel and applies its
/// suggestions to a live threshold, clamped to `[min, max]`.
pub struct AnomalyFeed {
    detector: Box<dyn AnomalyDetector>,
    threshold: Tunable<usize>,
    min: usize,
    max: usize,
    metrics: MetricsSink,
}

impl AnomalyFeed {
    pub fn new(
        detector: Box<dyn AnomalyDetector>,
        threshold: Tunable<usize>,
        min: usize,
        max: usize,
        metrics: MetricsSink,
    ) -> Self {
        Self { detector, threshold, min: min.max(1), max, metrics }
    }

    /// Run until the sample channel closes or shutdown is signalled.
    pub async fn run(
        mut self,
        mut samples: mpsc::Receiver<MetricSample>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                sample = samples.recv() => {
                    match sample {
                        Some(sample) => self.consume(&sample),
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn consume(&mut self, sample: &MetricSample) {
        let Some(adjustment) = self.detector.observe(sample) else {
            return;
        };
        let before = *self.threshold.get();
        let after = ((before as f64 * adjustment.scale).round() as usize)
            .clamp(self.min, self.max);
        if after == before {
            return;
        }
        self.threshold.set(after);
        self.metrics.increment(
            "anomaly_threshold_adjustments",
            1,
            labels([("reason", adjustment.reason.as_str())]),
        );
        tracing::info!(
            before,
            after,
            scale = adjustment.scale,
            reason = %adjustment.reason,
            "anomaly feed adjusted threshold"
        );
    }
}
