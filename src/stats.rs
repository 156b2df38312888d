//! Counters and the read-only diagnostics snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Monotonic counters updated by the dispatcher and the enqueue path.
#[derive(Debug, Default)]
pub struct Counters {
    cancelled_overflow: AtomicU64,
    failed: AtomicU64,
    overflow_pressure: AtomicU64,
    processed: AtomicU64,
    processing_micros: AtomicU64,
}

impl Counters {
    pub fn record_success(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.processing_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow_pressure(&self) {
        self.overflow_pressure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow_eviction(&self) {
        self.cancelled_overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn cancelled_overflow(&self) -> u64 {
        self.cancelled_overflow.load(Ordering::Relaxed)
    }

    pub fn overflow_pressure(&self) -> u64 {
        self.overflow_pressure.load(Ordering::Relaxed)
    }

    /// Average processing time over all successful operations.
    pub fn avg_processing_ms(&self) -> f64 {
        let processed = self.processed();
        if processed == 0 {
            return 0.0;
        }
        self.processing_micros.load(Ordering::Relaxed) as f64 / processed as f64 / 1_000.0
    }
}

/// Snapshot returned by [`crate::service::AuthQueueService::queue_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub avg_processing_ms: f64,
    /// Counts of registered operations keyed by status name
    pub operations_by_status: BTreeMap<String, usize>,
    /// Times a queue was observed at or above its watermark on enqueue
    pub overflow_pressure: u64,
    /// Pending depth per principal key
    pub queue_depths: BTreeMap<String, usize>,
    pub running: bool,
    pub total_cancelled_overflow: u64,
    pub total_failed: u64,
    pub total_processed: u64,
    pub total_queues: usize,
    /// Configured worker count while running, zero when stopped
    pub workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_processing_time_is_incremental() {
        let counters = Counters::default();
        assert_eq!(counters.avg_processing_ms(), 0.0);

        counters.record_success(Duration::from_millis(10));
        counters.record_success(Duration::from_millis(30));

        assert_eq!(counters.processed(), 2);
        let avg = counters.avg_processing_ms();
        assert!((avg - 20.0).abs() < 0.5, "avg was {avg}");
    }

    #[test]
    fn test_failure_and_overflow_counters() {
        let counters = Counters::default();
        counters.record_failure();
        counters.record_failure();
        counters.record_overflow_pressure();
        counters.record_overflow_eviction();

        assert_eq!(counters.failed(), 2);
        assert_eq!(counters.overflow_pressure(), 1);
        assert_eq!(counters.cancelled_overflow(), 1);
        assert_eq!(counters.processed(), 0);
    }
}
