//! Sequential operation runner.
//!
//! The runner drains a FIFO of [`Operation`]s one at a time. After each execution
//! it records the result in the shared [`OperationContext`] and asks the operation's
//! validator whether the run may continue. An error or a failed validation halts the
//! run: the remaining operations are dropped un-run and, if any already-succeeded
//! operation can be undone, compensations run in reverse order.

use crate::error::{Result, RunnerError};
use crate::lifecycle::RunState;
use crate::operation::Operation;
use crate::progress::{
    HaltReason, OperationStatus, ProgressBoard, ProgressReporter, RunEvent, StatusCode,
};
use callsheet_abstraction::{OperationContext, OperationError, RunLog};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where and why a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Halt {
    /// Id of the operation that stopped the run.
    pub operation_id: String,
    /// Name of the operation that stopped the run.
    pub operation_name: String,
    /// Why it stopped.
    pub reason: HaltReason,
}

impl Halt {
    fn new(op: &Operation, reason: HaltReason) -> Self {
        Self { operation_id: op.id().to_string(), operation_name: op.name().to_string(), reason }
    }
}

/// Result of draining the queue once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    /// Correlation id of the run.
    pub run_id: String,
    /// `Completed` or `Halted`.
    pub state: RunState,
    /// Number of operations whose execute function was invoked.
    pub executed: usize,
    /// Set when the run halted.
    pub halt: Option<Halt>,
    /// Ids of operations successfully compensated, in the order they were undone.
    pub compensated: Vec<String>,
}

impl RunOutcome {
    /// Whether every operation ran and validated.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }
}

/// Drains a queue of operations and reports progress.
pub struct OperationRunner {
    /// Operations waiting to run, in enqueue order.
    queue: VecDeque<Operation>,
    /// Whether observers should not expect per-step counts.
    indeterminate: bool,
    /// Event broadcaster and status board.
    reporter: ProgressReporter,
    /// Lifecycle state.
    state: RunState,
    /// Cancellation token handed to every operation of the run.
    cancel: CancellationToken,
}

impl fmt::Debug for OperationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRunner")
            .field("pending", &self.queue.len())
            .field("indeterminate", &self.indeterminate)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl OperationRunner {
    /// Creates an idle runner with an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            indeterminate: false,
            reporter: ProgressReporter::new(),
            state: RunState::Idle,
            cancel: CancellationToken::new(),
        }
    }

    /// Enqueues an operation and returns its id.
    ///
    /// Enqueuing after a finished run resets the runner for a fresh run.
    pub fn enqueue(&mut self, op: Operation) -> String {
        if self.state.is_finished() {
            self.reset();
        }
        let id = op.id().to_string();
        debug!(operation_id = %id, name = %op.name(), "Enqueueing operation");
        self.queue.push_back(op);
        id
    }

    /// Enqueues several operations in order.
    pub fn enqueue_all(&mut self, ops: impl IntoIterator<Item = Operation>) -> Vec<String> {
        ops.into_iter().map(|op| self.enqueue(op)).collect()
    }

    /// Marks the run as indeterminate (no per-step counts for observers).
    pub fn set_indeterminate(&mut self, indeterminate: bool) {
        self.indeterminate = indeterminate;
    }

    /// Whether the run is indeterminate.
    pub fn is_indeterminate(&self) -> bool {
        self.indeterminate
    }

    /// Number of operations waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Subscribes to run events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.reporter.subscribe()
    }

    /// Handle on the status board, readable while the run is in progress.
    pub fn progress_board(&self) -> ProgressBoard {
        self.reporter.board().clone()
    }

    /// Token that stops the run before the next operation and aborts poll waits.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn reset(&mut self) {
        debug!(from = ?self.state, "Resetting runner for a new run");
        self.state = RunState::Idle;
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
    }

    fn transition(&mut self, to: RunState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            error!(from = ?self.state, to = ?to, "Invalid run state transition");
            return Err(RunnerError::InvalidTransition { from: self.state, to });
        }
        debug!(from = ?self.state, to = ?to, "Run state transition");
        self.state = to;
        Ok(())
    }

    /// Drains the queue in the calling task.
    ///
    /// # Errors
    /// Returns [`RunnerError::NotRestartable`] when the previous run finished and
    /// nothing new was enqueued. Operation failures are reported in the outcome.
    pub async fn run_operations(&mut self) -> Result<RunOutcome> {
        if self.state.is_finished() {
            return Err(RunnerError::NotRestartable(self.state));
        }
        self.transition(RunState::Running)?;

        let run_id = Uuid::new_v4().to_string();
        let log = RunLog::new(run_id.clone(), self.reporter.log_sink());
        let mut ctx = OperationContext::new(run_id.clone(), log, self.cancel.clone());

        let snapshot =
            self.queue.iter().map(|op| OperationStatus::pending(op.id(), op.name())).collect();
        self.reporter.board().reset(snapshot).await;
        let total = (!self.indeterminate).then_some(self.queue.len());
        info!(run_id = %run_id, operations = self.queue.len(), "Starting run");
        self.reporter.emit(RunEvent::RunStarted { run_id: run_id.clone(), total });

        let mut executed = 0;
        let mut succeeded: Vec<Operation> = Vec::new();
        let mut halt = None;

        let mut position = 0;
        while let Some(op) = self.queue.pop_front() {
            let index = position;
            position += 1;
            if ctx.is_cancelled() {
                ctx.log().warn(format!("Run cancelled before {}", op.name()));
                halt = Some(Halt::new(&op, HaltReason::Cancelled));
                break;
            }

            self.reporter.mark(index, op.id(), op.name(), StatusCode::Running, None).await;
            ctx.log().info(format!("Running {}", op.name()));
            executed += 1;

            let result = match op.execute(&mut ctx).await {
                Ok(result) => {
                    ctx.record_success(result.clone());
                    result
                }
                Err(err) => {
                    ctx.record_failure();
                    warn!(
                        run_id = %run_id,
                        operation_id = %op.id(),
                        kind = err.kind(),
                        error = %err,
                        "Operation raised an error"
                    );
                    op.notify_error(&err);
                    let reason = match err {
                        OperationError::Cancelled => HaltReason::Cancelled,
                        other => HaltReason::Error(other.to_string()),
                    };
                    self.reporter
                        .mark(index, op.id(), op.name(), StatusCode::Failed, Some(reason.clone()))
                        .await;
                    ctx.log().warn(format!("{} failed", op.name()));
                    halt = Some(Halt::new(&op, reason));
                    break;
                }
            };

            if !op.validate(&ctx) {
                self.reporter
                    .mark(index, op.id(), op.name(), StatusCode::Failed, Some(HaltReason::ValidationFailed))
                    .await;
                ctx.log().warn(format!("{} did not pass validation", op.name()));
                halt = Some(Halt::new(&op, HaltReason::ValidationFailed));
                break;
            }

            self.reporter.mark(index, op.id(), op.name(), StatusCode::Succeeded, None).await;
            op.notify_completed(&result);
            succeeded.push(op);
        }

        let Some(halt) = halt else {
            self.transition(RunState::Completed)?;
            info!(run_id = %run_id, executed, "Run completed");
            self.reporter.emit(RunEvent::Completed { run_id: run_id.clone(), executed });
            return Ok(RunOutcome {
                run_id,
                state: RunState::Completed,
                executed,
                halt: None,
                compensated: Vec::new(),
            });
        };

        let dropped = self.queue.len();
        self.queue.clear();
        warn!(
            run_id = %run_id,
            operation_id = %halt.operation_id,
            reason = ?halt.reason,
            dropped,
            "Run halted"
        );

        let compensated = self.compensate(&ctx, &succeeded).await;
        self.transition(RunState::Halted)?;
        self.reporter.emit(RunEvent::Halted { run_id: run_id.clone(), reason: halt.reason.clone() });

        Ok(RunOutcome { run_id, state: RunState::Halted, executed, halt: Some(halt), compensated })
    }

    /// Undoes succeeded operations in reverse order. Failures are reported, not retried.
    async fn compensate(&self, ctx: &OperationContext, succeeded: &[Operation]) -> Vec<String> {
        // Compensations must not be short-circuited by the token that stopped the run.
        let mut undo_ctx = ctx.with_cancellation(CancellationToken::new());
        let mut compensated = Vec::new();

        for op in succeeded.iter().rev().filter(|op| op.has_compensation()) {
            undo_ctx.log().info(format!("Compensating {}", op.name()));
            let ok = match op.compensate(&mut undo_ctx).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(operation_id = %op.id(), error = %err, "Compensation failed");
                    undo_ctx.log().warn(format!("Compensation of {} failed: {}", op.name(), err));
                    false
                }
            };
            self.reporter.emit(RunEvent::Compensated {
                id: op.id().to_string(),
                name: op.name().to_string(),
                ok,
            });
            if ok {
                compensated.push(op.id().to_string());
            }
        }

        compensated
    }

    /// Drains the queue on a private current-thread runtime.
    ///
    /// For callers outside any async runtime. Calling this from within a tokio
    /// runtime panics; use [`OperationRunner::run_operations`] there.
    pub fn run_blocking(&mut self) -> Result<RunOutcome> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        runtime.block_on(self.run_operations())
    }

    /// Drains the queue on a background task.
    ///
    /// Subscribe to events before calling this; the returned handle gives the
    /// runner back together with the outcome.
    pub fn begin_operations(mut self) -> RunHandle {
        let cancel = self.cancel.clone();
        let join = tokio::spawn(async move {
            let outcome = self.run_operations().await;
            (self, outcome)
        });
        RunHandle { join, cancel }
    }
}

impl Default for OperationRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle on a run started with [`OperationRunner::begin_operations`].
#[derive(Debug)]
pub struct RunHandle {
    join: JoinHandle<(OperationRunner, Result<RunOutcome>)>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// Asks the run to stop before its next operation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the background task has finished.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the run and returns the runner with its outcome.
    pub async fn wait(self) -> Result<(OperationRunner, RunOutcome)> {
        let (runner, outcome) =
            self.join.await.map_err(|err| RunnerError::Join(err.to_string()))?;
        Ok((runner, outcome?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn ok_op(name: &str) -> Operation {
        Operation::new(name, |_ctx| async { Ok(Value::Null) })
    }

    #[tokio::test]
    async fn test_empty_queue_completes_once_then_refuses_restart() {
        let mut runner = OperationRunner::new();
        let outcome = runner.run_operations().await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.executed, 0);

        let err = runner.run_operations().await.unwrap_err();
        assert!(matches!(err, RunnerError::NotRestartable(RunState::Completed)));
    }

    #[tokio::test]
    async fn test_re_enqueue_starts_fresh_run() {
        let mut runner = OperationRunner::new();
        runner.enqueue(ok_op("first"));
        let first = runner.run_operations().await.unwrap();

        runner.enqueue(ok_op("second"));
        assert_eq!(runner.state(), RunState::Idle);
        let second = runner.run_operations().await.unwrap();

        assert!(second.is_completed());
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(runner.progress_board().snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_results_flow_through_context() {
        let mut runner = OperationRunner::new();
        runner.enqueue(Operation::new("produce", |_ctx| async { Ok(json!({"name": "rg-ab12"})) }));
        runner.enqueue(
            Operation::new("consume", |ctx: OperationContext| async move {
                Ok(ctx.last_result.unwrap_or(Value::Null))
            })
            .with_validator(|ctx| ctx.last_result == Some(json!({"name": "rg-ab12"}))),
        );

        let outcome = runner.run_operations().await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.executed, 2);
    }

    #[tokio::test]
    async fn test_run_started_reports_total_unless_indeterminate() {
        let mut runner = OperationRunner::new();
        runner.set_indeterminate(true);
        runner.enqueue(ok_op("only"));
        let mut rx = runner.subscribe();
        runner.run_operations().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, RunEvent::RunStarted { total: None, .. }));
    }

    #[tokio::test]
    async fn test_duplicate_ids_keep_separate_board_entries() {
        let mut runner = OperationRunner::new();
        runner.enqueue(ok_op("first").with_id("same"));
        runner.enqueue(ok_op("second").with_id("same").with_validator(|_ctx| false));
        let board = runner.progress_board();

        let outcome = runner.run_operations().await.unwrap();

        assert_eq!(outcome.executed, 2);
        let statuses: Vec<StatusCode> = board.snapshot().await.into_iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![StatusCode::Succeeded, StatusCode::Failed]);
    }

    #[test]
    fn test_run_blocking_outside_runtime() {
        let mut runner = OperationRunner::new();
        runner.enqueue(ok_op("sync"));
        let outcome = runner.run_blocking().unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.executed, 1);
    }
}
