//! Ingress instrumentation. Workers record, the API reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Shared ingress counters and batch-duration histogram.
pub struct IngressMetrics {
    /// Successful ingress runs since process start.
    succeeded: AtomicU64,
    /// Failed ingress runs (each one is retried with backoff).
    failed: AtomicU64,
    /// Records written across all runs.
    records: AtomicU64,
    /// Run durations in milliseconds.
    duration_ms: Mutex<hdrhistogram::Histogram<u64>>,
}

impl IngressMetrics {
    /// Tracks 1ms to 1h, 3 significant figures.
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 3_600_000, 3)
            .expect("valid histogram bounds");
        Self {
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            records: AtomicU64::new(0),
            duration_ms: Mutex::new(histogram),
        }
    }

    pub fn record_success(&self, duration: Duration, records: u64) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(records, Ordering::Relaxed);
        let ms = duration.as_millis().min(u128::from(u64::MAX)) as u64;
        let _ = self.duration_ms.lock().record(ms.max(1));
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let h = self.duration_ms.lock();
        let (p50, p95, p99) = if h.len() == 0 {
            (None, None, None)
        } else {
            (
                Some(h.value_at_quantile(0.5)),
                Some(h.value_at_quantile(0.95)),
                Some(h.value_at_quantile(0.99)),
            )
        };
        MetricsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            duration_p50_ms: p50,
            duration_p95_ms: p95,
            duration_p99_ms: p99,
        }
    }
}

impl Default for IngressMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub succeeded: u64,
    pub failed: u64,
    pub records: u64,
    pub duration_p50_ms: Option<u64>,
    pub duration_p95_ms: Option<u64>,
    pub duration_p99_ms: Option<u64>,
}
