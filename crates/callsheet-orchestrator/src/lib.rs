//! Operation orchestrator for Callsheet.
//!
//! This crate sequences named units of work: an [`OperationRunner`] drains a FIFO of
//! [`Operation`]s, validates each, halts on the first failure, and reports progress
//! through a broadcast event stream and a status board.
//!
//! ```no_run
//! use callsheet_orchestrator::{Operation, OperationRunner};
//! use serde_json::json;
//!
//! # async fn example() -> callsheet_orchestrator::Result<()> {
//! let mut runner = OperationRunner::new();
//! runner.enqueue(Operation::new("Create resource group", |_ctx| async {
//!     Ok(json!({"name": "callsheet-ab12"}))
//! }));
//!
//! let outcome = runner.run_operations().await?;
//! assert!(outcome.is_completed());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod id;
pub mod lifecycle;
pub mod operation;
pub mod progress;
pub mod runner;

pub use callsheet_abstraction::{
    OperationContext, OperationError, OperationStep, RunLog, STATUS_FAILURE, STATUS_SUCCESS,
};
pub use error::{Result, RunnerError};
pub use id::{DEFAULT_ID_LENGTH, IdRegistry, new_id, next_id, shared_id};
pub use lifecycle::RunState;
pub use operation::Operation;
pub use progress::{
    HaltReason, OperationStatus, ProgressBoard, ProgressReporter, RunEvent, StatusCode,
};
pub use runner::{Halt, OperationRunner, RunHandle, RunOutcome};
