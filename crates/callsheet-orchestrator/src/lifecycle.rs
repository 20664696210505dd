//! Run lifecycle.
//!
//! A runner moves `Idle → Running → {Completed | Halted}`. A finished runner only
//! goes back to `Idle` when new operations are enqueued for a fresh run.

use serde::{Deserialize, Serialize};

/// Execution state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Nothing is running; operations may be enqueued.
    Idle,
    /// The queue is being drained.
    Running,
    /// Every operation ran and validated.
    Completed,
    /// An operation failed validation, raised an error, or the run was cancelled.
    Halted,
}

impl RunState {
    /// Checks if the runner can transition to the given state.
    ///
    /// # Arguments
    /// * `to` - The target state
    ///
    /// # Returns
    /// Returns `true` if the transition is valid, `false` otherwise.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct state transition rule
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            // From Idle: start a run, or stay idle while enqueuing
            (Self::Idle, Self::Running | Self::Idle) => true,
            // From Running: finish one way or the other
            (Self::Running, Self::Completed | Self::Halted) => true,
            // Finished runs only reset to Idle
            (Self::Completed | Self::Halted, Self::Idle) => true,
            _ => false,
        }
    }

    /// Whether a run has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Halted)
    }
}
