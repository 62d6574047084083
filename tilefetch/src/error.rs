//! Error types for the scheduler and its collaborators.
//!
//! Three families:
//!
//! - [`SchedulerError`]: the scheduler refused an operation (shut down,
//!   invalid configuration, thread spawn failure)
//! - [`ConfigError`]: a [`SchedulerConfig`](crate::SchedulerConfig) failed validation
//! - [`DecodeError`]: a raster source could not produce pixels for a request
//!
//! Cancellation is modelled as [`DecodeError::Cancelled`] so decoders can
//! bail out with `?`, but the scheduler always reports it to the caller as a
//! cancellation, never as an error.

use thiserror::Error;

use crate::bucket::BucketKey;

/// Errors returned by [`Scheduler`](crate::Scheduler) operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler has been shut down and accepts no more work.
    #[error("Scheduler is shut down")]
    ShutDown,

    /// The configuration failed validation.
    #[error("Invalid scheduler configuration: {0}")]
    Config(#[from] ConfigError),

    /// The OS refused to spawn a dispatcher or worker thread.
    #[error("Failed to spawn {role} thread: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// No cost ceilings were configured.
    #[error("At least one bucket ceiling is required")]
    NoBuckets,

    /// A ceiling is NaN or not positive.
    #[error("Bucket ceiling {index} is invalid: {value}")]
    InvalidCeiling { index: usize, value: f64 },

    /// Ceilings must be strictly ascending.
    #[error("Bucket ceiling {index} is not greater than the previous ceiling")]
    CeilingsNotAscending { index: usize },

    /// The last ceiling must be unbounded so every request has a bucket.
    #[error("The last bucket ceiling must be unbounded (got {0})")]
    MissingUnboundedCeiling(f64),

    /// A custom worker layout with no workers.
    #[error("At least one worker is required")]
    NoWorkers,

    /// A worker with no bucket bindings.
    #[error("Worker {worker} is not bound to any bucket")]
    EmptyWorker { worker: usize },

    /// A worker bound to a bucket that does not exist.
    #[error("Worker {worker} is bound to unknown bucket {key}")]
    UnknownBucket { worker: usize, key: BucketKey },

    /// A bucket that no worker drains.
    #[error("Bucket {0} is not served by any worker")]
    UnservedBucket(BucketKey),
}

/// Errors a [`TileSource`](crate::TileSource) reports from a decode.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decode observed the request's cancellation and stopped early.
    #[error("Decode cancelled")]
    Cancelled,

    /// I/O error while reading the raster.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The raster data is malformed or unsupported.
    #[error("Format error: {0}")]
    Format(String),

    /// Any other source-specific failure.
    #[error("Source error: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The decoder or the result sink panicked; the worker survived and
    /// reports it here.
    #[error("Panicked while servicing request: {0}")]
    Panicked(String),
}

impl DecodeError {
    /// Creates a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    /// Wraps an arbitrary source error.
    pub fn from_source(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Source(Box::new(error))
    }

    /// Returns true if this is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_error_display() {
        assert_eq!(SchedulerError::ShutDown.to_string(), "Scheduler is shut down");

        let err: SchedulerError = ConfigError::NoBuckets.into();
        assert!(err.to_string().contains("Invalid scheduler configuration"));
        assert!(err.to_string().contains("At least one bucket ceiling"));
    }

    #[test]
    fn test_decode_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: DecodeError = io.into();
        assert!(matches!(err, DecodeError::Io(_)));
        assert!(err.to_string().contains("short read"));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_decode_error_cancelled() {
        assert!(DecodeError::Cancelled.is_cancelled());
        assert!(!DecodeError::format("bad header").is_cancelled());
    }

    #[test]
    fn test_config_error_mentions_bucket() {
        let err = ConfigError::UnservedBucket(BucketKey::new(1, true));
        assert!(err.to_string().contains("not served"));
    }
}
