//! Scheduler configuration.
//!
//! Defaults reproduce the classic layout: four cost ceilings
//! `[2, 17, 257, +inf]`, each split into a visible and a prefetch bucket,
//! with one dedicated worker per bucket.
//!
//! ```
//! use tilefetch::{BucketKey, SchedulerConfig, WorkerLayout};
//!
//! // Two ceilings; one worker for cheap visible tiles, one for the rest.
//! let config = SchedulerConfig::default()
//!     .with_bucket_ceilings(vec![17.0, f64::INFINITY])
//!     .with_workers(WorkerLayout::Custom(vec![
//!         vec![BucketKey::new(0, false)],
//!         vec![
//!             BucketKey::new(0, true),
//!             BucketKey::new(1, false),
//!             BucketKey::new(1, true),
//!         ],
//!     ]));
//! assert!(config.validate().is_ok());
//! ```

use crate::bucket::BucketKey;
use crate::error::ConfigError;

/// Default cost ceilings, ascending; the last is unbounded.
pub const DEFAULT_BUCKET_CEILINGS: [f64; 4] = [2.0, 17.0, 257.0, f64::INFINITY];

/// Default prefix for dispatcher and worker thread names.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "tilefetch";

/// How workers are bound to buckets.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum WorkerLayout {
    /// One worker per bucket, each draining only its own bucket.
    #[default]
    OnePerBucket,
    /// Explicit bindings: one entry per worker, listing the buckets it
    /// drains in scan order.
    Custom(Vec<Vec<BucketKey>>),
}

/// Configuration for a [`Scheduler`](crate::Scheduler).
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    /// Ascending cost ceilings; a request lands in the first ceiling that
    /// covers its cost.
    pub bucket_ceilings: Vec<f64>,
    /// Worker to bucket bindings.
    pub workers: WorkerLayout,
    /// Prefix for thread names (`{prefix}-dispatch`, `{prefix}-worker-{n}`).
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bucket_ceilings: DEFAULT_BUCKET_CEILINGS.to_vec(),
            workers: WorkerLayout::default(),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Set the bucket cost ceilings.
    pub fn with_bucket_ceilings(mut self, ceilings: Vec<f64>) -> Self {
        self.bucket_ceilings = ceilings;
        self
    }

    /// Set the worker layout.
    pub fn with_workers(mut self, workers: WorkerLayout) -> Self {
        self.workers = workers;
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Number of buckets (two per ceiling).
    pub fn bucket_count(&self) -> usize {
        self.bucket_ceilings.len() * 2
    }

    /// Number of worker threads this configuration spawns.
    pub fn worker_count(&self) -> usize {
        match &self.workers {
            WorkerLayout::OnePerBucket => self.bucket_count(),
            WorkerLayout::Custom(bindings) => bindings.len(),
        }
    }

    /// Checks ceilings and worker bindings.
    ///
    /// Ceilings must be positive, strictly ascending and end with `+inf` so
    /// every request has a bucket. Every bucket must be drained by at least
    /// one worker so nothing can strand.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(&last) = self.bucket_ceilings.last() else {
            return Err(ConfigError::NoBuckets);
        };

        for (index, &value) in self.bucket_ceilings.iter().enumerate() {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::InvalidCeiling { index, value });
            }
            if index > 0 && value <= self.bucket_ceilings[index - 1] {
                return Err(ConfigError::CeilingsNotAscending { index });
            }
        }
        if last != f64::INFINITY {
            return Err(ConfigError::MissingUnboundedCeiling(last));
        }

        let WorkerLayout::Custom(bindings) = &self.workers else {
            return Ok(());
        };
        if bindings.is_empty() {
            return Err(ConfigError::NoWorkers);
        }

        let bucket_count = self.bucket_count();
        let mut served = vec![false; bucket_count];
        for (worker, keys) in bindings.iter().enumerate() {
            if keys.is_empty() {
                return Err(ConfigError::EmptyWorker { worker });
            }
            for key in keys {
                if key.ceiling >= self.bucket_ceilings.len() {
                    return Err(ConfigError::UnknownBucket { worker, key: *key });
                }
                served[key.index()] = true;
            }
        }

        match served.iter().position(|&is_served| !is_served) {
            Some(index) => Err(ConfigError::UnservedBucket(BucketKey::from_index(index))),
            None => Ok(()),
        }
    }

    /// Bucket indices each worker drains, in scan order.
    ///
    /// Assumes the configuration has been validated.
    pub(crate) fn worker_bindings(&self) -> Vec<Vec<usize>> {
        match &self.workers {
            WorkerLayout::OnePerBucket => (0..self.bucket_count()).map(|index| vec![index]).collect(),
            WorkerLayout::Custom(bindings) => bindings
                .iter()
                .map(|keys| keys.iter().map(BucketKey::index).collect())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.bucket_ceilings, vec![2.0, 17.0, 257.0, f64::INFINITY]);
        assert_eq!(config.bucket_count(), 8);
        assert_eq!(config.worker_count(), 8);
        assert_eq!(config.thread_name_prefix, "tilefetch");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = SchedulerConfig::default()
            .with_bucket_ceilings(vec![f64::INFINITY])
            .with_thread_name_prefix("tiles");
        assert_eq!(config.bucket_count(), 2);
        assert_eq!(config.thread_name_prefix, "tiles");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_ceilings() {
        let config = SchedulerConfig::default().with_bucket_ceilings(vec![]);
        assert_eq!(config.validate(), Err(ConfigError::NoBuckets));
    }

    #[test]
    fn test_rejects_invalid_ceiling() {
        let config = SchedulerConfig::default().with_bucket_ceilings(vec![0.0, f64::INFINITY]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCeiling { index: 0, .. })
        ));

        let config = SchedulerConfig::default().with_bucket_ceilings(vec![f64::NAN, f64::INFINITY]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCeiling { index: 0, .. })
        ));
    }

    #[test]
    fn test_rejects_unordered_ceilings() {
        let config = SchedulerConfig::default().with_bucket_ceilings(vec![17.0, 2.0, f64::INFINITY]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::CeilingsNotAscending { index: 1 })
        );
    }

    #[test]
    fn test_rejects_bounded_last_ceiling() {
        let config = SchedulerConfig::default().with_bucket_ceilings(vec![2.0, 17.0]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingUnboundedCeiling(17.0))
        );
    }

    #[test]
    fn test_rejects_unserved_bucket() {
        let config = SchedulerConfig::default()
            .with_bucket_ceilings(vec![f64::INFINITY])
            .with_workers(WorkerLayout::Custom(vec![vec![BucketKey::new(0, false)]]));
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnservedBucket(BucketKey::new(0, true)))
        );
    }

    #[test]
    fn test_rejects_bad_worker_bindings() {
        let base = SchedulerConfig::default().with_bucket_ceilings(vec![f64::INFINITY]);

        let none = base.clone().with_workers(WorkerLayout::Custom(vec![]));
        assert_eq!(none.validate(), Err(ConfigError::NoWorkers));

        let empty = base
            .clone()
            .with_workers(WorkerLayout::Custom(vec![vec![], vec![BucketKey::new(0, false)]]));
        assert_eq!(empty.validate(), Err(ConfigError::EmptyWorker { worker: 0 }));

        let unknown = base.with_workers(WorkerLayout::Custom(vec![vec![BucketKey::new(5, false)]]));
        assert_eq!(
            unknown.validate(),
            Err(ConfigError::UnknownBucket {
                worker: 0,
                key: BucketKey::new(5, false)
            })
        );
    }

    #[test]
    fn test_worker_bindings() {
        let config = SchedulerConfig::default().with_bucket_ceilings(vec![17.0, f64::INFINITY]);
        assert_eq!(config.worker_bindings(), vec![vec![0], vec![1], vec![2], vec![3]]);

        let config = config.with_workers(WorkerLayout::Custom(vec![
            vec![BucketKey::new(0, false)],
            vec![BucketKey::new(1, true), BucketKey::new(0, true), BucketKey::new(1, false)],
        ]));
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_bindings(), vec![vec![0], vec![3, 1, 2]]);
        assert_eq!(config.worker_count(), 2);
    }
}
