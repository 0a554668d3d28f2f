//! Task updates pushed from the worker to the manager.

use serde::{Deserialize, Serialize};

use crate::{CommandResult, TaskId, TaskResult, TaskStatus};

/// One status/log update for a task.
///
/// `seq` is strictly increasing per task and is the manager's idempotence
/// key: a replayed update with an already-seen `seq` must not change state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: TaskId,

    pub seq: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_status: Option<TaskStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_command_idx: Option<usize>,

    /// Log delta since the previous update.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log: String,

    /// Commands that finished since the previous update.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_results: Vec<CommandResult>,
}

impl TaskUpdate {
    /// An empty update carrying only the sequence number.
    pub fn new(task_id: TaskId, seq: u64) -> Self {
        Self {
            task_id,
            seq,
            task_status: None,
            activity: None,
            current_command_idx: None,
            log: String::new(),
            command_results: Vec::new(),
        }
    }

    /// The terminal update for a finished task.
    pub fn terminal(result: &TaskResult, seq: u64) -> Self {
        let mut update = Self::new(result.task_id.clone(), seq);
        update.task_status = Some(result.status);
        update.activity = Some(result.activity());
        update
    }

    /// A terminal update with no execution behind it: startup recovery or a
    /// task whose payload could not be parsed.
    pub fn recovered(
        task_id: TaskId,
        seq: u64,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> Self {
        let mut update = Self::new(task_id, seq);
        update.task_status = Some(status);
        update.activity = Some(match reason {
            Some(reason) => format!("Task {}: {}", status, reason),
            None => format!("Task {}", status),
        });
        update
    }

    pub fn is_terminal(&self) -> bool {
        self.task_status.map(|s| s.is_terminal()).unwrap_or(false)
    }
}
