//! Request and response bodies of the machine HTTP boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{WireError, WireResult};
use crate::options::RunOptions;
use crate::status::TaskStatusRecord;

/// Body of `POST /tasks/run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskRequest {
    pub task_id: String,
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<RunOptions>,
}

impl RunTaskRequest {
    /// Checks the request before anything touches disk.
    ///
    /// Task ids become directory names, so only ASCII alphanumerics, `-` and
    /// `_` are accepted.
    pub fn validate(&self) -> WireResult<()> {
        validate_task_id(&self.task_id)?;
        if self.instructions.trim().is_empty() {
            return Err(WireError::InvalidRequest(
                "instructions must not be empty".to_string(),
            ));
        }
        if let Some(options) = &self.options {
            options.validate()?;
        }
        Ok(())
    }

    /// Options with defaults filled in.
    pub fn effective_options(&self) -> RunOptions {
        self.options.clone().unwrap_or_default()
    }
}

/// Rejects ids that are empty or could escape the working directory.
pub fn validate_task_id(task_id: &str) -> WireResult<()> {
    if task_id.is_empty() {
        return Err(WireError::InvalidRequest("taskId must not be empty".to_string()));
    }
    if !task_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WireError::InvalidRequest(format!(
            "taskId contains invalid characters: {task_id}"
        )));
    }
    Ok(())
}

/// Body of `GET /machine/availability`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    pub available: bool,
    #[serde(default)]
    pub current_task: Option<TaskStatusRecord>,
}

/// Body of `GET /tasks/{id}/status` and `POST /tasks/{id}/cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub task_status: TaskStatusRecord,
}

/// Body of `GET /tasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskStatusRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Error body returned by the machine agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskStatusRecord>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            current_task: None,
        }
    }
}
