//! Status records persisted by the machine agent.
//!
//! These are written verbatim to `task_<id>/task-status.json` and
//! `machine-status.json`, and returned as-is over HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a task as seen by the machine executing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusRecord {
    pub task_id: String,
    pub status: TaskState,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatusRecord {
    /// A freshly accepted task.
    pub fn running(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskState::Running,
            start_time: Utc::now(),
            end_time: None,
            error: None,
        }
    }

    /// Moves the record to a terminal state, stamping the end time.
    pub fn finish(&mut self, status: TaskState, error: Option<String>) {
        self.status = status;
        self.end_time = Some(Utc::now());
        self.error = error;
    }
}

/// The machine-wide Busy Record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatusRecord {
    pub current_task_id: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl MachineStatusRecord {
    pub fn idle() -> Self {
        Self {
            current_task_id: None,
            last_updated: Utc::now(),
        }
    }

    pub fn busy(task_id: impl Into<String>) -> Self {
        Self {
            current_task_id: Some(task_id.into()),
            last_updated: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_file_format() {
        let mut record = TaskStatusRecord::running("tsk_1");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["taskId"], "tsk_1");
        assert_eq!(json["status"], "running");
        assert!(json.get("startTime").is_some());
        assert!(json.get("endTime").is_none());

        record.finish(TaskState::Failed, Some("boom".to_string()));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
        assert!(json.get("endTime").is_some());
    }

    #[test]
    fn test_idle_machine_writes_null_task() {
        let json = serde_json::to_value(MachineStatusRecord::idle()).unwrap();
        assert!(json["currentTaskId"].is_null());
        assert!(json.get("lastUpdated").is_some());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }
}
