//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backoff::RetryPolicy;

/// Configuration errors, reported before the worker starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("manager URL must start with http:// or https://, got '{0}'")]
    InvalidManagerUrl(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("backoff ceiling ({ceiling:?}) is below the initial backoff ({initial:?})")]
    BackoffCeilingTooLow { initial: Duration, ceiling: Duration },

    #[error("max attempts must be at least 1")]
    NoAttempts,
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Manager base URL.
    pub manager_url: String,

    /// Directory holding credentials and the task marker.
    pub state_dir: PathBuf,

    /// Name shown in the manager's worker list.
    pub nickname: String,

    /// Task types this worker accepts.
    pub task_types: Vec<String>,

    /// Delay between polls while idle.
    pub poll_interval: Duration,

    /// Delay between heartbeats.
    pub heartbeat_interval: Duration,

    /// First retry delay after a transient failure.
    pub backoff_initial: Duration,

    /// Upper bound for a single retry delay.
    pub backoff_ceiling: Duration,

    /// Attempts per call before giving up for this round.
    pub max_attempts: u32,

    /// Per-request network timeout.
    pub request_timeout: Duration,

    /// How often buffered log output is flushed to the manager.
    pub push_interval: Duration,

    /// Log bytes that force an early flush.
    pub max_batch_bytes: usize,

    /// How often the manager is asked whether the running task may continue.
    pub cancel_check_interval: Duration,

    /// Default timeout for `exec` commands without their own.
    pub command_timeout: Option<Duration>,

    /// Output cap per command.
    pub max_output_bytes: u64,

    /// Time allowed for the final report when shutting down.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manager_url: "http://localhost:8083".to_string(),
            state_dir: PathBuf::from("farmhand-state"),
            nickname: "farmhand-worker".to_string(),
            task_types: vec!["sleep".to_string(), "echo".to_string(), "exec".to_string()],
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            backoff_initial: Duration::from_millis(500),
            backoff_ceiling: Duration::from_secs(30),
            max_attempts: 8,
            request_timeout: Duration::from_secs(30),
            push_interval: Duration::from_secs(1),
            max_batch_bytes: 256 * 1024,
            cancel_check_interval: Duration::from_secs(10),
            command_timeout: None,
            max_output_bytes: 16 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Check the configuration for values the worker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.manager_url.starts_with("http://") || self.manager_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidManagerUrl(self.manager_url.clone()));
        }

        let durations = [
            ("poll interval", self.poll_interval),
            ("heartbeat interval", self.heartbeat_interval),
            ("initial backoff", self.backoff_initial),
            ("request timeout", self.request_timeout),
            ("push interval", self.push_interval),
            ("cancel check interval", self.cancel_check_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        if self.backoff_ceiling < self.backoff_initial {
            return Err(ConfigError::BackoffCeilingTooLow {
                initial: self.backoff_initial,
                ceiling: self.backoff_ceiling,
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        Ok(())
    }

    /// Retry policy for manager calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial: self.backoff_initial,
            ceiling: self.backoff_ceiling,
            max_attempts: self.max_attempts,
        }
    }
}
