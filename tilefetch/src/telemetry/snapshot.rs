//! Point-in-time view of scheduler counters.

use std::fmt;
use std::time::Duration;

/// A copy of [`SchedulerMetrics`](super::SchedulerMetrics) taken at one
/// instant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub started: u64,
    pub completed: u64,
    pub canceled: u64,
    pub failed: u64,
    pub discarded: u64,
    pub resort_cycles: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Requests that have not yet reached a terminal state.
    pub fn outstanding(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed + self.canceled + self.failed)
    }

    /// Requests that reached any terminal state.
    pub fn finished(&self) -> u64 {
        self.completed + self.canceled + self.failed
    }

    /// Completed decodes per second since the scheduler started.
    pub fn completions_per_second(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.completed as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "submitted={} started={} completed={} canceled={} failed={} discarded={} resorts={}",
            self.submitted,
            self.started,
            self.completed,
            self.canceled,
            self.failed,
            self.discarded,
            self.resort_cycles
        )
    }
}
