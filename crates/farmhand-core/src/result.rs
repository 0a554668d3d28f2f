//! Per-command and per-task results.

use serde::{Deserialize, Serialize};

use crate::{CommandOutcome, TaskId, TaskStatus};

/// Byte offsets `[start, end)` of a command's output within the task log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRange {
    pub start: u64,
    pub end: u64,
}

impl LogRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of running one command. Created once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Position of the command within its task.
    pub index: usize,

    /// Type tag of the command.
    pub name: String,

    pub outcome: CommandOutcome,

    /// Process exit code, when the command was a process that exited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Where this command's output lives in the task log.
    pub log_range: LogRange,

    /// The output cap was hit and some output was dropped.
    #[serde(default)]
    pub truncated: bool,

    /// Diagnostic detail (spawn error, signal, timeout...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommandResult {
    pub fn new(index: usize, name: impl Into<String>, outcome: CommandOutcome) -> Self {
        Self {
            index,
            name: name.into(),
            outcome,
            exit_code: None,
            log_range: LogRange::default(),
            truncated: false,
            detail: None,
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_log_range(mut self, range: LogRange) -> Self {
        self.log_range = range;
        self
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    /// Ok and nothing was cut from the output.
    pub fn is_clean_ok(&self) -> bool {
        self.outcome.is_ok() && !self.truncated
    }

    /// Human-readable one-line summary, used for task activity and reasons.
    pub fn summary(&self) -> String {
        let mut s = format!("command #{} ({}) {}", self.index, self.name, self.outcome);
        if let Some(code) = self.exit_code {
            if self.outcome != CommandOutcome::Ok {
                s.push_str(&format!(" with exit code {}", code));
            }
        }
        if let Some(detail) = &self.detail {
            s.push_str(": ");
            s.push_str(detail);
        }
        if self.truncated {
            s.push_str(" [output truncated]");
        }
        s
    }
}

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,

    /// One of `Completed`, `Failed`, `Canceled`.
    pub status: TaskStatus,

    /// Why the task did not complete, if it didn't.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Results in command order; only for commands that were started.
    pub command_results: Vec<CommandResult>,

    /// Indices of commands that never started.
    #[serde(default)]
    pub not_run: Vec<usize>,
}

impl TaskResult {
    /// Derive the task result from the results of the commands that ran.
    ///
    /// `results` must be in command order and stop at the first non-ok
    /// outcome. Fewer results than commands with every result ok means the
    /// run was cut short by cancellation.
    pub fn from_command_results(
        task_id: TaskId,
        command_count: usize,
        results: Vec<CommandResult>,
    ) -> Self {
        let not_run: Vec<usize> = (results.len()..command_count).collect();

        let failure = results.iter().find_map(|r| match r.outcome {
            CommandOutcome::Ok => None,
            CommandOutcome::Failed => Some((TaskStatus::Failed, r.summary())),
            CommandOutcome::Timeout => Some((
                TaskStatus::Failed,
                format!("command #{} ({}) timed out", r.index, r.name),
            )),
            CommandOutcome::Canceled => Some((
                TaskStatus::Canceled,
                format!("canceled during command #{} ({})", r.index, r.name),
            )),
        });

        let (status, reason) = match failure {
            Some((status, reason)) => (status, Some(reason)),
            None if not_run.is_empty() => (TaskStatus::Completed, None),
            None => (
                TaskStatus::Canceled,
                Some(format!("canceled before command #{}", results.len())),
            ),
        };

        Self {
            task_id,
            status,
            reason,
            command_results: results,
            not_run,
        }
    }

    /// Result for a task whose payload failed validation. Nothing was run.
    pub fn invalid(task_id: TaskId, command_count: usize, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            reason: Some(reason.into()),
            command_results: Vec::new(),
            not_run: (0..command_count).collect(),
        }
    }

    /// Short activity line for the manager's task view.
    pub fn activity(&self) -> String {
        match &self.reason {
            Some(reason) => format!("Task {}: {}", self.status, reason),
            None => format!("Task {}", self.status),
        }
    }
}
