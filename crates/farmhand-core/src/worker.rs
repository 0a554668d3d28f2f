//! Worker-side messages exchanged with the manager.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{TaskId, WorkerActivity, WorkerId};

/// Sent once at startup to obtain a session token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: WorkerId,

    /// Shared secret generated by the worker on first start.
    pub secret: String,

    pub nickname: String,

    /// Hostname of the worker machine.
    pub hostname: String,

    /// Operating system family ("linux", "windows", ...).
    pub platform: String,

    /// Worker binary version.
    pub version: String,

    /// Task types this worker is willing to run.
    pub supported_task_types: Vec<String>,
}

/// Opaque credential returned by the manager on registration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(***)")
    }
}

/// Periodic liveness report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    pub activity: WorkerActivity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,

    pub timestamp_ms: i64,
}

impl Heartbeat {
    pub fn new(worker_id: WorkerId, current_task: Option<TaskId>) -> Self {
        let activity = if current_task.is_some() {
            WorkerActivity::Busy
        } else {
            WorkerActivity::Idle
        };
        Self {
            worker_id,
            activity,
            current_task,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Manager's answer to "may I keep running this task?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepRunning {
    pub may_keep_running: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl KeepRunning {
    pub fn yes() -> Self {
        Self {
            may_keep_running: true,
            reason: None,
        }
    }

    pub fn no(reason: impl Into<String>) -> Self {
        Self {
            may_keep_running: false,
            reason: Some(reason.into()),
        }
    }
}
