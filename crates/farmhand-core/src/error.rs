//! Core domain errors.

use thiserror::Error;

use crate::TaskId;

/// Core domain errors for farmhand.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A task payload without a usable id. Nothing can be reported for it.
    #[error("Invalid task payload: {0}")]
    InvalidTask(String),

    /// A task payload with an id whose remaining fields are malformed.
    #[error("Invalid task payload for {task_id}: {reason}")]
    MalformedTask { task_id: TaskId, reason: String },
}
