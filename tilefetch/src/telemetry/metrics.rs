//! Atomic scheduler counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::snapshot::MetricsSnapshot;

/// Counters for request flow through the scheduler.
///
/// Every counter is monotonic. `canceled` counts terminal cancellations,
/// pending or in service. `discarded` counts cancelled requests later dropped
/// from the intake or a bucket; they are already counted in `canceled`.
#[derive(Debug)]
pub struct SchedulerMetrics {
    submitted: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    canceled: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    resort_cycles: AtomicU64,
    created_at: Instant,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerMetrics {
    /// Create a new set of counters, all zero.
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            canceled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            resort_cycles: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn request_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_canceled(&self) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record requests dropped without execution because they were
    /// cancelled while queued.
    pub fn requests_discarded(&self, count: u64) {
        if count > 0 {
            self.discarded.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Record one dispatcher re-sort cycle.
    pub fn resort_cycle(&self) {
        self.resort_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            resort_cycles: self.resort_cycles.load(Ordering::Relaxed),
            uptime: self.created_at.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_metrics_are_zero() {
        let snapshot = SchedulerMetrics::new().snapshot();
        assert_eq!(snapshot.submitted, 0);
        assert_eq!(snapshot.resort_cycles, 0);
        assert_eq!(snapshot.outstanding(), 0);
    }

    #[test]
    fn test_discarded_ignores_zero() {
        let metrics = SchedulerMetrics::new();
        metrics.requests_discarded(0);
        metrics.requests_discarded(3);
        assert_eq!(metrics.snapshot().discarded, 3);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(SchedulerMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.request_submitted();
                        metrics.request_canceled();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submitted, 4000);
        assert_eq!(snapshot.canceled, 4000);
        assert_eq!(snapshot.outstanding(), 0);
    }
}
