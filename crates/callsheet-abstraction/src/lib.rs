//! Operation abstraction layer for Callsheet.
//!
//! This crate defines the contract between the operation runner and the units of
//! work it sequences: the [`OperationStep`] trait, the [`OperationContext`] threaded
//! through a run, and the [`OperationError`] type every step reports failures with.

pub mod context;
pub mod log;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use context::{OperationContext, STATUS_FAILURE, STATUS_SUCCESS};
pub use log::{LogSink, RunLog};

/// Represents an error raised while executing an operation.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationError {
    /// A remote API answered with a non-success HTTP status.
    #[error("Request failed ({status}): {reason}")]
    Request {
        /// The HTTP status code.
        status: u16,
        /// The reason phrase or response body excerpt.
        reason: String,
    },

    /// A remote call could not be sent or its response could not be read.
    #[error("Transport Error: {0}")]
    Transport(String),

    /// An error occurred during serialization or deserialization.
    #[error("Serialization Error: {0}")]
    Serialization(String),

    /// The operation was configured with invalid input.
    #[error("Configuration Error: {0}")]
    Configuration(String),

    /// The run was cancelled while the operation was in flight.
    #[error("Operation cancelled")]
    Cancelled,

    /// Other unexpected errors.
    #[error("Other Operation Error: {0}")]
    Other(String),
}

impl OperationError {
    /// Short machine-readable name of the error kind, logged when an operation fails.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Transport(_) => "transport",
            Self::Serialization(_) => "serialization",
            Self::Configuration(_) => "configuration",
            Self::Cancelled => "cancelled",
            Self::Other(_) => "other",
        }
    }
}

impl From<serde_json::Error> for OperationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for operation steps.
pub type Result<T> = std::result::Result<T, OperationError>;

/// A unit of work the runner can sequence.
///
/// `execute` performs the work and returns an opaque JSON result, which the runner
/// stores in [`OperationContext::last_result`]. `validate` then decides whether the
/// run may continue. The hooks are side-effect channels for the caller and never
/// influence whether the run proceeds.
#[async_trait]
pub trait OperationStep: Send + Sync {
    /// Performs the operation.
    ///
    /// # Errors
    /// Any error halts the run; the validator is not consulted afterwards.
    async fn execute(&self, ctx: &mut OperationContext) -> Result<Value>;

    /// Decides whether the operation succeeded well enough for the run to continue.
    ///
    /// The default accepts any execution that returned `Ok`.
    fn validate(&self, ctx: &OperationContext) -> bool {
        ctx.last_status_code == STATUS_SUCCESS
    }

    /// Called with the raw result after a successful validation.
    fn on_completed(&self, _result: &Value) {}

    /// Called with the error when `execute` fails.
    fn on_error(&self, _error: &OperationError) {}

    /// Whether [`OperationStep::compensate`] undoes anything.
    fn has_compensation(&self) -> bool {
        false
    }

    /// Undoes the effect of a previously successful execution.
    ///
    /// Only invoked after a later operation halted the run, and only when
    /// [`OperationStep::has_compensation`] returns `true`.
    async fn compensate(&self, _ctx: &mut OperationContext) -> Result<()> {
        Ok(())
    }
}
