//! Progress reporting for operation runs.
//!
//! This module mirrors queue state into an observable status board and broadcasts
//! run events (including the textual log stream) to any number of subscribers.
//! The runner never touches UI state directly; a UI subscribes and renders.

use callsheet_abstraction::LogSink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

/// Capacity of the event channel. Slow subscribers see `Lagged` beyond this.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status of one operation as shown to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// Not executed (yet, or ever if the run halted before it).
    NotStarted,
    /// Currently executing.
    Running,
    /// Executed and validated.
    Succeeded,
    /// Raised an error or failed validation.
    Failed,
}

/// Projection of one queued operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    /// Operation id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: StatusCode,
}

impl OperationStatus {
    /// Creates a `NotStarted` entry.
    #[must_use]
    pub fn pending(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into(), status: StatusCode::NotStarted }
    }
}

/// Why a run halted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum HaltReason {
    /// The operation's validator returned `false`.
    ValidationFailed,
    /// The operation returned an error.
    Error(String),
    /// The run's cancellation token was tripped.
    Cancelled,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationFailed => write!(f, "validation failed"),
            Self::Error(message) => write!(f, "{message}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The queue snapshot was taken and draining begins.
    RunStarted {
        /// Run id.
        run_id: String,
        /// Number of operations, or `None` for indeterminate runs.
        total: Option<usize>,
    },
    /// An operation began executing.
    OperationStarted {
        /// Operation id.
        id: String,
        /// Operation name.
        name: String,
    },
    /// An operation executed and validated.
    OperationSucceeded {
        /// Operation id.
        id: String,
        /// Operation name.
        name: String,
    },
    /// An operation raised an error or failed validation.
    OperationFailed {
        /// Operation id.
        id: String,
        /// Operation name.
        name: String,
        /// What went wrong.
        reason: HaltReason,
    },
    /// A human-readable log line.
    Log {
        /// Line text.
        line: String,
    },
    /// A compensation ran for a previously succeeded operation.
    Compensated {
        /// Operation id.
        id: String,
        /// Operation name.
        name: String,
        /// Whether the undo succeeded.
        ok: bool,
    },
    /// The run stopped before draining the queue.
    Halted {
        /// Run id.
        run_id: String,
        /// Why it stopped.
        reason: HaltReason,
    },
    /// Every operation ran and validated. Sent at most once per run.
    Completed {
        /// Run id.
        run_id: String,
        /// Number of operations executed.
        executed: usize,
    },
}

/// Shared, readable view of every operation's status in the current run.
#[derive(Debug, Clone, Default)]
pub struct ProgressBoard {
    entries: Arc<RwLock<Vec<OperationStatus>>>,
}

impl ProgressBoard {
    /// Creates an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the board with a fresh snapshot.
    pub async fn reset(&self, entries: Vec<OperationStatus>) {
        *self.entries.write().await = entries;
    }

    /// Updates the entry at `index` (its queue position). Out-of-range
    /// positions are ignored.
    ///
    /// Ids are short random strings and may repeat, so the runner addresses
    /// entries by position.
    pub async fn set_status_at(&self, index: usize, status: StatusCode) {
        if let Some(entry) = self.entries.write().await.get_mut(index) {
            entry.status = status;
        }
    }

    /// Copies the current board.
    pub async fn snapshot(&self) -> Vec<OperationStatus> {
        self.entries.read().await.clone()
    }

    /// Status of the first operation with `id`.
    pub async fn status_of(&self, id: &str) -> Option<StatusCode> {
        self.entries.read().await.iter().find(|e| e.id == id).map(|e| e.status)
    }
}

/// Progress reporter for operation runs.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    /// Broadcast sender for run events.
    broadcast_tx: broadcast::Sender<RunEvent>,
    /// Status board for the current run.
    board: ProgressBoard,
}

impl ProgressReporter {
    /// Creates a new progress reporter.
    #[must_use]
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { broadcast_tx, board: ProgressBoard::new() }
    }

    /// Subscribes to run events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.broadcast_tx.subscribe()
    }

    /// The status board.
    pub fn board(&self) -> &ProgressBoard {
        &self.board
    }

    /// Broadcasts an event. Having no subscribers is not an error.
    pub fn emit(&self, event: RunEvent) {
        debug!("Progress event: {:?}", event);
        let _ = self.broadcast_tx.send(event);
    }

    /// Updates the board entry at `index` and broadcasts the matching event.
    pub async fn mark(
        &self,
        index: usize,
        id: &str,
        name: &str,
        status: StatusCode,
        reason: Option<HaltReason>,
    ) {
        self.board.set_status_at(index, status).await;
        let (id, name) = (id.to_string(), name.to_string());
        match status {
            StatusCode::Running => self.emit(RunEvent::OperationStarted { id, name }),
            StatusCode::Succeeded => self.emit(RunEvent::OperationSucceeded { id, name }),
            StatusCode::Failed => self.emit(RunEvent::OperationFailed {
                id,
                name,
                reason: reason.unwrap_or(HaltReason::ValidationFailed),
            }),
            StatusCode::NotStarted => {}
        }
    }

    /// A log sink that forwards lines as [`RunEvent::Log`].
    pub fn log_sink(&self) -> Arc<dyn LogSink> {
        Arc::new(EventLogSink { tx: self.broadcast_tx.clone() })
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

struct EventLogSink {
    tx: broadcast::Sender<RunEvent>,
}

impl LogSink for EventLogSink {
    fn line(&self, line: &str) {
        let _ = self.tx.send(RunEvent::Log { line: line.to_string() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_board_updates_in_place() {
        let board = ProgressBoard::new();
        board
            .reset(vec![OperationStatus::pending("a1", "first"), OperationStatus::pending("b2", "second")])
            .await;

        board.set_status_at(1, StatusCode::Running).await;
        board.set_status_at(7, StatusCode::Failed).await;

        let snapshot = board.snapshot().await;
        assert_eq!(snapshot[0].status, StatusCode::NotStarted);
        assert_eq!(snapshot[1].status, StatusCode::Running);
        assert_eq!(board.status_of("zz").await, None);
    }

    #[tokio::test]
    async fn test_board_tells_duplicate_ids_apart() {
        let board = ProgressBoard::new();
        board
            .reset(vec![OperationStatus::pending("same", "first"), OperationStatus::pending("same", "second")])
            .await;

        board.set_status_at(0, StatusCode::Succeeded).await;
        board.set_status_at(1, StatusCode::Failed).await;

        let statuses: Vec<StatusCode> = board.snapshot().await.into_iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![StatusCode::Succeeded, StatusCode::Failed]);
    }

    #[tokio::test]
    async fn test_reporter_events() {
        let reporter = ProgressReporter::new();
        let mut rx = reporter.subscribe();
        reporter.board().reset(vec![OperationStatus::pending("a1", "deploy")]).await;

        reporter.mark(0, "a1", "deploy", StatusCode::Running, None).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RunEvent::OperationStarted { .. }));

        reporter
            .mark(0, "a1", "deploy", StatusCode::Failed, Some(HaltReason::Error("boom".to_string())))
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            RunEvent::OperationFailed {
                id: "a1".to_string(),
                name: "deploy".to_string(),
                reason: HaltReason::Error("boom".to_string()),
            }
        );
        assert_eq!(reporter.board().status_of("a1").await, Some(StatusCode::Failed));
    }

    #[tokio::test]
    async fn test_log_sink_emits_log_events() {
        let reporter = ProgressReporter::new();
        let mut rx = reporter.subscribe();
        reporter.log_sink().line("Creating resource group");

        let event = rx.recv().await.unwrap();
        assert_eq!(event, RunEvent::Log { line: "Creating resource group".to_string() });
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = RunEvent::Halted { run_id: "r1".to_string(), reason: HaltReason::Cancelled };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "halted");
        assert_eq!(json["reason"]["kind"], "cancelled");
    }

    #[test]
    fn test_halt_reason_display() {
        assert_eq!(HaltReason::ValidationFailed.to_string(), "validation failed");
        assert_eq!(HaltReason::Error("Request failed (409): Conflict".to_string()).to_string(), "Request failed (409): Conflict");
    }
}
