//! Scheduler telemetry.
//!
//! Lock-free counters updated by the dispatcher, workers and cancelling
//! threads, plus a point-in-time snapshot for display.
//!
//! ```text
//! Dispatcher / Workers ─────► SchedulerMetrics ─────► MetricsSnapshot ─────► CLI
//!                             (atomic counters)       (point-in-time copy)
//! ```
//!
//! # Example
//!
//! ```
//! use tilefetch::SchedulerMetrics;
//!
//! let metrics = SchedulerMetrics::new();
//! metrics.request_submitted();
//! metrics.request_started();
//! metrics.request_completed();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.completed, 1);
//! assert_eq!(snapshot.outstanding(), 0);
//! ```

mod metrics;
mod snapshot;

pub use metrics::SchedulerMetrics;
pub use snapshot::MetricsSnapshot;
