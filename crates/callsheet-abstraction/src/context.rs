//! Mutable state shared by the operations of one run.

use crate::log::RunLog;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Status code recorded after an operation returned `Ok`.
pub const STATUS_SUCCESS: i32 = 0;

/// Status code recorded after an operation returned an error.
pub const STATUS_FAILURE: i32 = -1;

/// State threaded through every operation of a single run.
///
/// One context exists per run. The runner writes `last_status_code` and
/// `last_result` after each execution; the executing step may read anything and
/// publish values for later steps through [`OperationContext::set_var`].
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Correlation id of the run.
    pub run_id: String,
    /// `STATUS_SUCCESS` or `STATUS_FAILURE` for the last executed operation.
    pub last_status_code: i32,
    /// The value returned by the last successful execution.
    pub last_result: Option<Value>,
    /// Values published by earlier operations.
    vars: BTreeMap<String, Value>,
    log: RunLog,
    cancel: CancellationToken,
}

impl OperationContext {
    /// Creates the context for a run.
    #[must_use]
    pub fn new(run_id: impl Into<String>, log: RunLog, cancel: CancellationToken) -> Self {
        Self {
            run_id: run_id.into(),
            last_status_code: STATUS_SUCCESS,
            last_result: None,
            vars: BTreeMap::new(),
            log,
            cancel,
        }
    }

    /// Creates a context with no log sink and a fresh cancellation token.
    ///
    /// Useful for exercising a step outside a runner.
    #[must_use]
    pub fn detached() -> Self {
        Self::new("detached", RunLog::detached("detached"), CancellationToken::new())
    }

    /// The run's log.
    pub fn log(&self) -> &RunLog {
        &self.log
    }

    /// The run's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Copies the context with a different cancellation token.
    ///
    /// The runner uses this to run compensations after a cancelled run.
    #[must_use]
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self.clone() }
    }

    /// Whether the run has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Records a successful execution.
    pub fn record_success(&mut self, result: Value) {
        self.last_status_code = STATUS_SUCCESS;
        self.last_result = Some(result);
    }

    /// Records a failed execution. `last_result` keeps the previous value.
    pub fn record_failure(&mut self) {
        self.last_status_code = STATUS_FAILURE;
    }

    /// Publishes a value for later operations.
    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    /// Reads a published value.
    pub fn var(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Reads a published string value.
    pub fn var_str(&self, key: &str) -> Option<&str> {
        self.vars.get(key).and_then(Value::as_str)
    }
}
