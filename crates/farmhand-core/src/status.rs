//! Status enums for tasks, commands and the worker.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Status of a task as the manager and the worker agree on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Waiting on the manager side; not yet handed to a worker.
    #[default]
    Queued,
    /// Claimed by a worker and (about to be) executing.
    Active,
    /// Every command finished ok.
    Completed,
    /// At least one command failed or timed out, or the payload was invalid.
    Failed,
    /// Cancellation was requested before the task finished.
    Canceled,
}

impl TaskStatus {
    /// Returns true if the status will not change any more.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Ok,
    Failed,
    Timeout,
    Canceled,
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Local execution state of one task inside the executor.
///
/// `Received -> Running -> {Completed | Failed | Canceled}`. A task may also
/// go straight from `Received` to `Failed` (invalid payload) or `Canceled`
/// (canceled before the first command started).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionState {
    #[default]
    Received,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl ExecutionState {
    /// Returns true for the immutable end states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Move to `next`, refusing any transition out of a terminal state.
    pub fn advance(&mut self, next: ExecutionState) -> Result<(), CoreError> {
        let allowed = match (*self, next) {
            (Self::Received, Self::Running) => true,
            (Self::Received, Self::Failed | Self::Canceled) => true,
            (Self::Running, n) => n.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(CoreError::InvalidStateTransition {
                from: format!("{:?}", self),
                to: format!("{:?}", next),
            });
        }
        *self = next;
        Ok(())
    }

    /// The task status a terminal execution state maps onto.
    pub fn task_status(&self) -> TaskStatus {
        match self {
            Self::Received | Self::Running => TaskStatus::Active,
            Self::Completed => TaskStatus::Completed,
            Self::Failed => TaskStatus::Failed,
            Self::Canceled => TaskStatus::Canceled,
        }
    }
}

/// What the worker is doing, as reported in heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerActivity {
    #[default]
    Idle,
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Active.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_task_status_wire_names() {
        let json = serde_json::to_string(&TaskStatus::Canceled).unwrap();
        assert_eq!(json, "\"canceled\"");
        let parsed: TaskStatus = serde_json::from_str("\"active\"").unwrap();
        assert_eq!(parsed, TaskStatus::Active);
    }

    #[test]
    fn test_execution_state_happy_path() {
        let mut state = ExecutionState::default();
        state.advance(ExecutionState::Running).unwrap();
        state.advance(ExecutionState::Completed).unwrap();
        assert_eq!(state.task_status(), TaskStatus::Completed);
    }

    #[test]
    fn test_execution_state_terminal_is_immutable() {
        let mut state = ExecutionState::Running;
        state.advance(ExecutionState::Failed).unwrap();
        let err = state.advance(ExecutionState::Running).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        assert!(state.advance(ExecutionState::Completed).is_err());
        assert_eq!(state, ExecutionState::Failed);
    }

    #[test]
    fn test_execution_state_received_cannot_complete() {
        let mut state = ExecutionState::Received;
        assert!(state.advance(ExecutionState::Completed).is_err());
        state.advance(ExecutionState::Canceled).unwrap();
    }
}
