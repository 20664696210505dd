// Error types for the operation runner

use crate::lifecycle::RunState;
use thiserror::Error;

/// Result type for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Runner errors
///
/// These describe misuse of the runner itself. Failures of individual operations
/// never surface here; they halt the run and are reported in the outcome.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The queue was already drained and nothing new was enqueued
    #[error("Runner already finished ({0:?}); enqueue operations to start a new run")]
    NotRestartable(RunState),

    /// Lifecycle transition not allowed
    #[error("Invalid run state transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state
        from: RunState,
        /// Requested state
        to: RunState,
    },

    /// The background task running the queue panicked or was aborted
    #[error("Background run failed: {0}")]
    Join(String),

    /// IO error (building the runtime for a blocking run)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
