//! Task execution: runs a task's commands one after the other.

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use farmhand_core::{
    CommandOutcome, CommandResult, ExecutionEvent, ExecutionState, Task, TaskResult, TaskStatus,
};

use crate::runner::{CommandRunner, OutputSink, ValidationError};

/// Runs whole tasks on top of a [`CommandRunner`].
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    runner: CommandRunner,
    max_output_bytes: u64,
}

impl TaskExecutor {
    pub fn new(runner: CommandRunner, max_output_bytes: u64) -> Self {
        Self {
            runner,
            max_output_bytes,
        }
    }

    /// Check every command of `task` against its type.
    ///
    /// Returns the index of the first invalid command and the reason.
    pub fn validate(&self, task: &Task) -> Result<(), (usize, ValidationError)> {
        for (index, command) in task.commands.iter().enumerate() {
            self.runner
                .registry()
                .validate(command)
                .map_err(|e| (index, e))?;
        }
        Ok(())
    }

    /// Execute `task` to a terminal result.
    ///
    /// Progress is sent on `events` as it happens. Commands run strictly in
    /// order and execution stops at the first command that does not succeed.
    /// Cancelling `cancel` stops the running command and skips the rest.
    pub async fn execute(
        &self,
        task: &Task,
        events: UnboundedSender<ExecutionEvent>,
        cancel: &CancellationToken,
    ) -> TaskResult {
        let mut state = ExecutionState::Received;
        let command_count = task.commands.len();

        if let Err((index, e)) = self.validate(task) {
            warn!(task_id = %task.id, command_index = index, error = %e, "Task is invalid");
            transition(&task.id, &mut state, ExecutionState::Failed);
            return TaskResult::invalid(
                task.id.clone(),
                command_count,
                format!("invalid command #{}: {}", index, e),
            );
        }

        transition(&task.id, &mut state, ExecutionState::Running);
        info!(task_id = %task.id, commands = command_count, "Executing task");

        let mut results: Vec<CommandResult> = Vec::with_capacity(command_count);
        let mut log_offset = 0;

        for (index, command) in task.commands.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(task_id = %task.id, command_index = index, "Cancelled before command");
                break;
            }

            let _ = events.send(ExecutionEvent::CommandStarted {
                index,
                name: command.name.clone(),
            });
            let sink = OutputSink::new(index, events.clone(), self.max_output_bytes, log_offset);

            let result = match self.runner.run(index, command, &sink, cancel).await {
                Ok(result) => result,
                // Validated above; only reachable if the registry changed.
                Err(e) => CommandResult::new(index, command.name.clone(), CommandOutcome::Failed)
                    .with_detail(e.to_string()),
            };
            log_offset = sink.offset();

            let stop = !result.outcome.is_ok();
            let _ = events.send(ExecutionEvent::CommandFinished(result.clone()));
            results.push(result);
            if stop {
                break;
            }
        }

        let result = TaskResult::from_command_results(task.id.clone(), command_count, results);
        let terminal = match result.status {
            TaskStatus::Completed => ExecutionState::Completed,
            TaskStatus::Canceled => ExecutionState::Canceled,
            _ => ExecutionState::Failed,
        };
        transition(&task.id, &mut state, terminal);

        info!(
            task_id = %task.id,
            status = %result.status,
            reason = result.reason.as_deref().unwrap_or(""),
            not_run = result.not_run.len(),
            "Task finished"
        );
        result
    }
}

fn transition(task_id: &farmhand_core::TaskId, state: &mut ExecutionState, next: ExecutionState) {
    if let Err(e) = state.advance(next) {
        warn!(task_id = %task_id, error = %e, "Ignoring illegal execution state transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use farmhand_core::Command;
    use tokio::sync::mpsc;

    use crate::runner::CommandRegistry;
    use crate::testing::Exit;

    fn executor() -> TaskExecutor {
        let mut registry = CommandRegistry::with_builtin(None);
        registry.register(Exit);
        TaskExecutor::new(CommandRunner::new(registry), 1 << 20)
    }

    fn drain(mut rx: mpsc::UnboundedReceiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_all_commands_ok_completes() {
        let task = Task::new("t1", "j1")
            .with_command(Command::new("echo").with_setting("message", "a"))
            .with_command(Command::new("exit"));
        let (tx, rx) = mpsc::unbounded_channel();
        let result = executor().execute(&task, tx, &CancellationToken::new()).await;

        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.command_results.len(), 2);
        assert!(result.not_run.is_empty());

        let events = drain(rx);
        assert!(matches!(events[0], ExecutionEvent::CommandStarted { index: 0, .. }));
        assert!(matches!(events.last(), Some(ExecutionEvent::CommandFinished(r)) if r.index == 1));
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let task = Task::new("t1", "j1")
            .with_command(Command::new("exit"))
            .with_command(Command::new("exit").with_setting("code", 1))
            .with_command(Command::new("exit"));
        let (tx, rx) = mpsc::unbounded_channel();
        let result = executor().execute(&task, tx, &CancellationToken::new()).await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.command_results.len(), 2);
        assert_eq!(result.command_results[0].outcome, CommandOutcome::Ok);
        assert_eq!(result.command_results[1].outcome, CommandOutcome::Failed);
        assert_eq!(result.command_results[1].exit_code, Some(1));
        assert_eq!(result.not_run, vec![2]);

        let started: Vec<usize> = drain(rx)
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::CommandStarted { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_log_ranges_are_contiguous() {
        let task = Task::new("t1", "j1")
            .with_command(Command::new("exit"))
            .with_command(Command::new("echo").with_setting("message", "two\nlines"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = executor().execute(&task, tx, &CancellationToken::new()).await;

        let ranges: Vec<_> = result.command_results.iter().map(|r| r.log_range).collect();
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[0].end, "working\n".len() as u64);
        assert_eq!(ranges[1].start, ranges[0].end);
        assert_eq!(ranges[1].len(), "two\nlines\n".len() as u64);
    }

    #[tokio::test]
    async fn test_invalid_command_runs_nothing() {
        let task = Task::new("t1", "j1")
            .with_command(Command::new("echo").with_setting("message", "a"))
            .with_command(Command::new("sleep"));
        let (tx, rx) = mpsc::unbounded_channel();
        let result = executor().execute(&task, tx, &CancellationToken::new()).await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.command_results.is_empty());
        assert!(result.reason.unwrap().starts_with("invalid command #1"));
        assert_eq!(result.not_run, vec![0, 1]);
        assert!(drain(rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_command() {
        let task = Task::new("t1", "j1")
            .with_command(Command::new("sleep").with_setting("time_in_seconds", 3600))
            .with_command(Command::new("exit"));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let started = tokio::time::Instant::now();
        let result = executor().execute(&task, tx, &cancel).await;

        assert_eq!(result.status, TaskStatus::Canceled);
        assert_eq!(result.command_results.len(), 1);
        assert_eq!(result.not_run, vec![1]);
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let task = Task::new("t1", "j1").with_command(Command::new("exit"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = executor().execute(&task, tx, &cancel).await;

        assert_eq!(result.status, TaskStatus::Canceled);
        assert!(result.command_results.is_empty());
    }
}
