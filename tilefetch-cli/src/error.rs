//! CLI error types.

use thiserror::Error;
use tilefetch::SchedulerError;

/// Errors surfaced to the user by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to set signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}
