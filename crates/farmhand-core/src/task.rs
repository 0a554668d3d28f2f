//! Task and Command types, as received from the manager.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CoreError, JobId, TaskId, TaskStatus};

/// Named settings of a command. Shape depends on the command type.
pub type Settings = Map<String, Value>;

/// A Task is one unit of work assigned by the manager.
///
/// Field names follow the manager's JSON documents, which is why the id is
/// `_id` and the job reference is `job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    #[serde(rename = "_id")]
    pub id: TaskId,

    /// Job this task belongs to.
    #[serde(rename = "job", default)]
    pub job_id: JobId,

    /// Human-readable task name.
    #[serde(default)]
    pub name: String,

    /// Scheduling hint from the manager. Informational only.
    #[serde(default)]
    pub priority: i32,

    /// Status as last seen by the manager.
    #[serde(default)]
    pub status: TaskStatus,

    /// Commands to run, in order.
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl Task {
    /// Create a new Task.
    pub fn new(id: impl Into<TaskId>, job_id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            job_id: job_id.into(),
            name: String::new(),
            priority: 0,
            status: TaskStatus::Queued,
            commands: Vec::new(),
        }
    }

    /// Builder method to set the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder method to append a command.
    pub fn with_command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Parse a task out of a manager JSON document.
    ///
    /// The id is read first, so a document that names a task but is
    /// otherwise malformed yields [`CoreError::MalformedTask`] and can still
    /// be reported back as failed.
    pub fn from_json(value: Value) -> Result<Self, CoreError> {
        let task_id = match value.get("_id").and_then(Value::as_str) {
            Some("") => return Err(CoreError::InvalidTask("task has an empty id".to_string())),
            Some(id) => TaskId::new(id),
            None => return Err(CoreError::InvalidTask("task has no string _id".to_string())),
        };
        serde_json::from_value(value).map_err(|e| CoreError::MalformedTask {
            task_id,
            reason: e.to_string(),
        })
    }
}

/// One executable step within a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Type tag that selects the command implementation.
    pub name: String,

    /// Settings for that implementation.
    #[serde(default)]
    pub settings: Settings,
}

impl Command {
    /// Create a command with no settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: Settings::new(),
        }
    }

    /// Builder method to add a setting.
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_manager_document() {
        let doc = json!({
            "_id": "58b66b4e3a9f3c1d0c7d5a10",
            "job": "58b66b4e3a9f3c1d0c7d5a00",
            "name": "render-frames-1-10",
            "priority": 50,
            "status": "queued",
            "job_type": "blender-render",
            "commands": [
                {"name": "echo", "settings": {"message": "starting"}},
                {"name": "exec", "settings": {"cmd": "blender", "args": ["-b"]}}
            ]
        });

        let task = Task::from_json(doc).unwrap();
        assert_eq!(task.id.as_str(), "58b66b4e3a9f3c1d0c7d5a10");
        assert_eq!(task.job_id.as_str(), "58b66b4e3a9f3c1d0c7d5a00");
        assert_eq!(task.priority, 50);
        assert_eq!(task.commands.len(), 2);
        assert_eq!(task.commands[1].name, "exec");
        assert_eq!(task.commands[1].settings["cmd"], "blender");
    }

    #[test]
    fn test_missing_settings_defaults_to_empty() {
        let task = Task::from_json(json!({"_id": "t1", "commands": [{"name": "sleep"}]})).unwrap();
        assert!(task.commands[0].settings.is_empty());
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn test_missing_id_is_invalid() {
        let err = Task::from_json(json!({"commands": []})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTask(_)));

        let err = Task::from_json(json!({"_id": ""})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTask(_)));

        let err = Task::from_json(json!({"_id": 42})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTask(_)));
    }

    #[test]
    fn test_malformed_commands_keep_task_id() {
        let docs = [
            json!({"_id": "t-7", "job": "j", "commands": [{"settings": {"message": "hi"}}]}),
            json!({"_id": "t-7", "commands": [{"name": "echo", "settings": "hi"}]}),
            json!({"_id": "t-7", "commands": {"name": "echo"}}),
        ];
        for doc in docs {
            match Task::from_json(doc) {
                Err(CoreError::MalformedTask { task_id, reason }) => {
                    assert_eq!(task_id.as_str(), "t-7");
                    assert!(!reason.is_empty());
                }
                other => panic!("expected a malformed task, got {:?}", other),
            }
        }
    }
}
