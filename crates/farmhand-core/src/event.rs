//! Progress events emitted while a task executes.

use serde::{Deserialize, Serialize};

use crate::CommandResult;

/// Which pipe a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Lines generated by the worker itself (markers, in-process commands).
    Worker,
}

/// A progress event from the task executor, delivered as it happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A command is about to start.
    CommandStarted { index: usize, name: String },

    /// One line of command output.
    Output {
        index: usize,
        stream: OutputStream,
        line: String,
    },

    /// A command reached a terminal outcome.
    CommandFinished(CommandResult),
}

impl ExecutionEvent {
    /// Index of the command this event is about.
    pub fn command_index(&self) -> usize {
        match self {
            Self::CommandStarted { index, .. } | Self::Output { index, .. } => *index,
            Self::CommandFinished(result) => result.index,
        }
    }
}
