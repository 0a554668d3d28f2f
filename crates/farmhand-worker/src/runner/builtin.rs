//! Built-in command types.
//!
//! | Type    | Settings                                              |
//! |---------|-------------------------------------------------------|
//! | `exec`  | `cmd`, `args`, `cwd`, `env`, `timeout_secs`           |
//! | `echo`  | `message`                                             |
//! | `sleep` | `time_in_seconds`, `timeout_secs`                     |

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use farmhand_core::{OutputStream, Settings};

use super::process::{run_process, ProcessSpec};
use super::settings::{optional_secs, optional_str, optional_str_list, optional_str_map, required_str};
use super::sink::OutputSink;
use super::{CommandType, Completion, ValidationError};

fn timeout_setting(settings: &Settings, command: &str) -> Option<Duration> {
    optional_secs(settings, command, "timeout_secs")
        .ok()
        .flatten()
        .filter(|timeout| !timeout.is_zero())
}

/// Runs an external program.
#[derive(Debug, Clone, Default)]
pub struct Exec {
    default_timeout: Option<Duration>,
}

impl Exec {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }

    fn spec(settings: &Settings) -> Result<ProcessSpec, ValidationError> {
        let program = required_str(settings, "exec", "cmd")?;
        let args = optional_str_list(settings, "exec", "args")?;
        let cwd = optional_str(settings, "exec", "cwd")?.map(PathBuf::from);
        let env = optional_str_map(settings, "exec", "env")?;
        Ok(ProcessSpec {
            program: program.to_string(),
            args,
            cwd,
            env,
        })
    }
}

#[async_trait]
impl CommandType for Exec {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn validate(&self, settings: &Settings) -> Result<(), ValidationError> {
        optional_secs(settings, "exec", "timeout_secs")?;
        Self::spec(settings).map(|_| ())
    }

    fn timeout(&self, settings: &Settings) -> Option<Duration> {
        timeout_setting(settings, "exec").or(self.default_timeout)
    }

    async fn execute(
        &self,
        settings: &Settings,
        sink: &OutputSink,
        _cancel: &CancellationToken,
    ) -> Completion {
        match Self::spec(settings) {
            Ok(spec) => run_process(&spec, sink).await,
            Err(e) => Completion::failed(e.to_string()),
        }
    }
}

/// Writes its message to the task log.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

#[async_trait]
impl CommandType for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn validate(&self, settings: &Settings) -> Result<(), ValidationError> {
        required_str(settings, "echo", "message").map(|_| ())
    }

    async fn execute(
        &self,
        settings: &Settings,
        sink: &OutputSink,
        _cancel: &CancellationToken,
    ) -> Completion {
        match required_str(settings, "echo", "message") {
            Ok(message) => {
                for line in message.lines() {
                    sink.line(OutputStream::Stdout, line);
                }
                Completion::ok()
            }
            Err(e) => Completion::failed(e.to_string()),
        }
    }
}

/// Waits for a while. Handy for testing a farm end to end.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sleep;

#[async_trait]
impl CommandType for Sleep {
    fn name(&self) -> &'static str {
        "sleep"
    }

    fn validate(&self, settings: &Settings) -> Result<(), ValidationError> {
        optional_secs(settings, "sleep", "timeout_secs")?;
        match optional_secs(settings, "sleep", "time_in_seconds")? {
            Some(_) => Ok(()),
            None => Err(ValidationError::MissingSetting {
                command: "sleep".to_string(),
                key: "time_in_seconds".to_string(),
            }),
        }
    }

    fn timeout(&self, settings: &Settings) -> Option<Duration> {
        timeout_setting(settings, "sleep")
    }

    async fn execute(
        &self,
        settings: &Settings,
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Completion {
        let duration = match optional_secs(settings, "sleep", "time_in_seconds") {
            Ok(Some(duration)) => duration,
            Ok(None) => return Completion::failed("missing time_in_seconds"),
            Err(e) => return Completion::failed(e.to_string()),
        };
        sink.note(format!("sleeping for {}s", duration.as_secs_f64()));
        tokio::select! {
            _ = cancel.cancelled() => Completion::canceled(),
            _ = tokio::time::sleep(duration) => Completion::ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmhand_core::Command;
    use serde_json::json;

    fn settings(command: Command) -> Settings {
        command.settings
    }

    #[test]
    fn test_exec_validation() {
        let exec = Exec::default();
        assert!(exec
            .validate(&settings(Command::new("exec").with_setting("cmd", "blender")))
            .is_ok());
        assert!(matches!(
            exec.validate(&Settings::new()),
            Err(ValidationError::MissingSetting { .. })
        ));
        assert!(matches!(
            exec.validate(&settings(
                Command::new("exec")
                    .with_setting("cmd", "blender")
                    .with_setting("args", "not-a-list")
            )),
            Err(ValidationError::InvalidSetting { .. })
        ));
    }

    #[test]
    fn test_exec_timeout_falls_back_to_default() {
        let exec = Exec::new(Some(Duration::from_secs(600)));
        let own = settings(
            Command::new("exec")
                .with_setting("cmd", "true")
                .with_setting("timeout_secs", 5),
        );
        assert_eq!(exec.timeout(&own), Some(Duration::from_secs(5)));
        assert_eq!(
            exec.timeout(&settings(Command::new("exec").with_setting("cmd", "true"))),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_sleep_validation() {
        assert!(Sleep
            .validate(&settings(Command::new("sleep").with_setting("time_in_seconds", 2)))
            .is_ok());
        assert!(Sleep.validate(&Settings::new()).is_err());
        assert!(Sleep
            .validate(&settings(
                Command::new("sleep").with_setting("time_in_seconds", json!("soon"))
            ))
            .is_err());
    }

    #[test]
    fn test_out_of_range_durations_are_rejected() {
        let sleep = Command::new("sleep").with_setting("time_in_seconds", 1e20);
        assert!(matches!(
            Sleep.validate(&settings(sleep)),
            Err(ValidationError::InvalidSetting { .. })
        ));

        let exec = Command::new("exec")
            .with_setting("cmd", "true")
            .with_setting("timeout_secs", 1e20);
        assert!(matches!(
            Exec::new(None).validate(&settings(exec)),
            Err(ValidationError::InvalidSetting { .. })
        ));
    }

    #[test]
    fn test_echo_requires_message() {
        assert!(Echo.validate(&Settings::new()).is_err());
    }
}
