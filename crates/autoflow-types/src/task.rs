//! TaskInstance: the execution record of one action call or hook event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskInstanceStatus {
    #[default]
    Init,
    Canceled,
    Running,
    Ending,
    Failed,
    Retrying,
    Success,
    Blocked,
    Skipped,
}

impl TaskInstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskInstanceStatus::Init => "init",
            TaskInstanceStatus::Canceled => "canceled",
            TaskInstanceStatus::Running => "running",
            TaskInstanceStatus::Ending => "ending",
            TaskInstanceStatus::Failed => "failed",
            TaskInstanceStatus::Retrying => "retrying",
            TaskInstanceStatus::Success => "success",
            TaskInstanceStatus::Blocked => "blocked",
            TaskInstanceStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskInstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskInstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("invalid task instance status: '{s}'"))
    }
}

/// One progress message an action recorded while it ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTrace {
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl TaskTrace {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Label of the VM call frame that produced the record.
    pub task_id: String,
    pub dag_ins_id: String,
    /// Title of the VM call frame.
    pub name: String,
    pub action_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    pub status: TaskInstanceStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<TaskTrace>,
}

impl TaskInstance {
    pub fn new(
        dag_ins_id: impl Into<String>,
        task_id: impl Into<String>,
        name: impl Into<String>,
        action_name: impl Into<String>,
        status: TaskInstanceStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id(),
            created_at: now,
            updated_at: now,
            task_id: task_id.into(),
            dag_ins_id: dag_ins_id.into(),
            name: name.into(),
            action_name: action_name.into(),
            params: None,
            results: None,
            status,
            reason: String::new(),
            traces: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_results(mut self, results: Value) -> Self {
        self.results = Some(results);
        self
    }

    pub fn apply_patch(&mut self, patch: &TaskInstancePatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(reason) = &patch.reason {
            self.reason = reason.clone();
        }
        if let Some(results) = &patch.results {
            self.results = Some(results.clone());
        }
        self.traces.extend(patch.traces.iter().cloned());
        self.updated_at = Utc::now();
    }
}

/// Partial update of a TaskInstance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskInstancePatch {
    pub id: String,
    pub status: Option<TaskInstanceStatus>,
    pub reason: Option<String>,
    pub results: Option<Value>,
    /// Appended to the existing traces.
    pub traces: Vec<TaskTrace>,
}

impl TaskInstancePatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: Some(TaskInstanceStatus::Failed),
            reason: Some(reason.into()),
            ..Self::new(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskInstanceStatus::Running,
            TaskInstanceStatus::Blocked,
            TaskInstanceStatus::Skipped,
        ] {
            let parsed: TaskInstanceStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("done".parse::<TaskInstanceStatus>().is_err());
    }

    #[test]
    fn failed_patch_sets_status_and_reason() {
        let mut task = TaskInstance::new("ins", "t1", "Copy", "@anyshare/file/copy", TaskInstanceStatus::Running);
        task.apply_patch(&TaskInstancePatch::failed(task.id.clone(), "disk full"));
        assert_eq!(task.status, TaskInstanceStatus::Failed);
        assert_eq!(task.reason, "disk full");
        assert!(task.results.is_none());
    }

    #[test]
    fn patch_appends_traces() {
        let mut task = TaskInstance::new("ins", "t1", "Copy", "@anyshare/file/copy", TaskInstanceStatus::Running);
        task.apply_patch(&TaskInstancePatch {
            traces: vec![TaskTrace::new("run start")],
            ..TaskInstancePatch::new(task.id.clone())
        });
        task.apply_patch(&TaskInstancePatch {
            traces: vec![TaskTrace::new("copied 4 files")],
            ..TaskInstancePatch::new(task.id.clone())
        });
        let messages: Vec<&str> = task.traces.iter().map(|t| t.message.as_str()).collect();
        assert_eq!(messages, vec!["run start", "copied 4 files"]);

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["traces"][1]["message"], "copied 4 files");
    }
}
