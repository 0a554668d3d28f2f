//! Command runner: executes one command of a task.
//!
//! Command types are looked up by name in a [`CommandRegistry`]. The
//! [`CommandRunner`] validates the settings, then races the command against
//! its timeout and the cancellation token. Losing the race drops the command
//! future, which kills any child process it spawned.

pub mod builtin;
pub mod process;
pub mod settings;
pub mod sink;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use farmhand_core::{Command, CommandOutcome, CommandResult, Settings};

pub use sink::OutputSink;

/// A command's settings do not fit its type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown command type '{0}'")]
    UnknownType(String),

    #[error("command '{command}' requires setting '{key}'")]
    MissingSetting { command: String, key: String },

    #[error("setting '{key}' of command '{command}' must be {expected}")]
    InvalidSetting {
        command: String,
        key: String,
        expected: &'static str,
    },
}

/// How a command finished, before it is turned into a [`CommandResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub outcome: CommandOutcome,
    pub exit_code: Option<i32>,
    pub detail: Option<String>,
}

impl Completion {
    pub fn ok() -> Self {
        Self {
            outcome: CommandOutcome::Ok,
            exit_code: Some(0),
            detail: None,
        }
    }

    /// A process exit with a non-zero code.
    pub fn exited(code: i32) -> Self {
        Self {
            outcome: CommandOutcome::Failed,
            exit_code: Some(code),
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            outcome: CommandOutcome::Failed,
            exit_code: None,
            detail: Some(detail.into()),
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self {
            outcome: CommandOutcome::Timeout,
            exit_code: None,
            detail: Some(format!("timed out after {:?}", after)),
        }
    }

    pub fn canceled() -> Self {
        Self {
            outcome: CommandOutcome::Canceled,
            exit_code: None,
            detail: Some("canceled".to_string()),
        }
    }
}

/// A kind of command the worker knows how to run.
#[async_trait]
pub trait CommandType: Send + Sync {
    /// Type tag matched against [`Command::name`].
    fn name(&self) -> &'static str;

    /// Check the settings before anything is executed.
    fn validate(&self, settings: &Settings) -> Result<(), ValidationError>;

    /// Time limit for one execution, if any.
    fn timeout(&self, _settings: &Settings) -> Option<Duration> {
        None
    }

    /// Run the command to completion.
    ///
    /// `settings` have passed [`CommandType::validate`]. Implementations may
    /// watch `cancel` to stop early, but the runner also stops them by
    /// dropping the future.
    async fn execute(
        &self,
        settings: &Settings,
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Completion;
}

/// Command types by name.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    types: HashMap<&'static str, Arc<dyn CommandType>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `exec`, `echo` and `sleep`.
    pub fn with_builtin(default_timeout: Option<Duration>) -> Self {
        let mut registry = Self::new();
        registry.register(builtin::Exec::new(default_timeout));
        registry.register(builtin::Echo);
        registry.register(builtin::Sleep);
        registry
    }

    /// Add a command type, replacing any with the same name.
    pub fn register(&mut self, command_type: impl CommandType + 'static) {
        self.types.insert(command_type.name(), Arc::new(command_type));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandType>> {
        self.types.get(name).cloned()
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.types.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Validate `command` against its type.
    pub fn validate(&self, command: &Command) -> Result<Arc<dyn CommandType>, ValidationError> {
        let command_type = self
            .get(&command.name)
            .ok_or_else(|| ValidationError::UnknownType(command.name.clone()))?;
        command_type.validate(&command.settings)?;
        Ok(command_type)
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("types", &self.names())
            .finish()
    }
}

/// Runs single commands with timeout and cancellation.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    registry: CommandRegistry,
}

impl CommandRunner {
    pub fn new(registry: CommandRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Run command `index`.
    ///
    /// Only validation problems are errors; anything that goes wrong while
    /// running is reported in the returned [`CommandResult`].
    pub async fn run(
        &self,
        index: usize,
        command: &Command,
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, ValidationError> {
        let command_type = self.registry.validate(command)?;
        let timeout = command_type.timeout(&command.settings);

        info!(command_index = index, command = %command.name, ?timeout, "Running command");

        let execution = command_type.execute(&command.settings, sink, cancel);
        let completion = tokio::select! {
            biased;

            _ = cancel.cancelled() => Completion::canceled(),

            _ = sleep_or_pending(timeout) => match timeout {
                Some(after) => Completion::timed_out(after),
                None => Completion::failed("timer fired without a timeout"),
            },

            completion = execution => completion,
        };

        match completion.outcome {
            CommandOutcome::Ok => {
                debug!(command_index = index, command = %command.name, "Command finished")
            }
            outcome => warn!(
                command_index = index,
                command = %command.name,
                %outcome,
                exit_code = ?completion.exit_code,
                detail = completion.detail.as_deref().unwrap_or(""),
                "Command did not succeed"
            ),
        }

        let mut result = CommandResult::new(index, command.name.clone(), completion.outcome)
            .with_exit_code(completion.exit_code)
            .with_log_range(sink.log_range())
            .with_truncated(sink.is_truncated());
        if let Some(detail) = completion.detail {
            result = result.with_detail(detail);
        }
        Ok(result)
    }
}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(after) => tokio::time::sleep(after).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmhand_core::ExecutionEvent;
    use tokio::sync::mpsc;

    fn runner() -> CommandRunner {
        CommandRunner::new(CommandRegistry::with_builtin(None))
    }

    fn sink() -> (OutputSink, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutputSink::new(0, tx, 1 << 20, 0), rx)
    }

    #[test]
    fn test_builtin_registry() {
        assert_eq!(
            CommandRegistry::with_builtin(None).names(),
            vec!["echo", "exec", "sleep"]
        );
    }

    #[tokio::test]
    async fn test_unknown_type_is_validation_error() {
        let (sink, _rx) = sink();
        let err = runner()
            .run(0, &Command::new("teleport"), &sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::UnknownType("teleport".to_string()));
    }

    #[tokio::test]
    async fn test_echo_result_carries_log_range() {
        let (sink, mut rx) = sink();
        let command = Command::new("echo").with_setting("message", "hi");
        let result = runner()
            .run(0, &command, &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_clean_ok());
        assert_eq!(result.log_range.len(), 3);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ExecutionEvent::Output { ref line, .. } if line == "hi"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wins_over_slow_command() {
        let (sink, _rx) = sink();
        let command = Command::new("sleep")
            .with_setting("time_in_seconds", 60)
            .with_setting("timeout_secs", 1);
        let result = runner()
            .run(1, &command, &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.outcome, CommandOutcome::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_command() {
        let (sink, _rx) = sink();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let command = Command::new("sleep").with_setting("time_in_seconds", 3600);
        let result = runner().run(0, &command, &sink, &cancel).await.unwrap();
        assert_eq!(result.outcome, CommandOutcome::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_wins_when_already_requested() {
        let (sink, _rx) = sink();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let command = Command::new("echo").with_setting("message", "late");
        let result = runner().run(0, &command, &sink, &cancel).await.unwrap();
        assert_eq!(result.outcome, CommandOutcome::Canceled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_child_process() {
        let (sink, _rx) = sink();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let command = Command::new("exec")
            .with_setting("cmd", "sleep")
            .with_setting("args", serde_json::json!(["30"]));
        let started = std::time::Instant::now();
        let result = runner().run(0, &command, &sink, &cancel).await.unwrap();

        assert_eq!(result.outcome, CommandOutcome::Canceled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
