use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cloudagent_wire::{ErrorResponse, TaskStatusRecord};
use tracing::error;

use crate::executor::ExecutorError;
use crate::status_store::StatusStoreError;

/// Error returned by machine agent handlers, rendered as `{error, currentTask?}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse::new(message),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn with_current_task(mut self, task: TaskStatusRecord) -> Self {
        self.body.current_task = Some(task);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<StatusStoreError> for ApiError {
    fn from(e: StatusStoreError) -> Self {
        error!(error = %e, "Status store failure");
        Self::internal(e.to_string())
    }
}

impl From<ExecutorError> for ApiError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Busy(current) => {
                Self::conflict("Machine is busy").with_current_task(*current)
            }
            ExecutorError::NotFound(_) => Self::not_found("Task not found"),
            ExecutorError::AlreadyFinished(record) => {
                Self::conflict(format!("Task is already {}", record.status))
            }
            ExecutorError::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudagent_wire::TaskState;
    use rstest::rstest;

    fn finished(status: TaskState) -> Box<TaskStatusRecord> {
        let mut record = TaskStatusRecord::running("t1");
        record.finish(status, None);
        Box::new(record)
    }

    #[rstest]
    #[case::busy(
        ExecutorError::Busy(Box::new(TaskStatusRecord::running("t0"))),
        StatusCode::CONFLICT,
        "Machine is busy"
    )]
    #[case::not_found(ExecutorError::NotFound("t1".into()), StatusCode::NOT_FOUND, "Task not found")]
    #[case::finished(
        ExecutorError::AlreadyFinished(finished(TaskState::Completed)),
        StatusCode::CONFLICT,
        "Task is already completed"
    )]
    #[case::store(
        ExecutorError::Store(StatusStoreError::Io {
            path: "/tmp/x".into(),
            source: std::io::Error::other("disk gone"),
        }),
        StatusCode::INTERNAL_SERVER_ERROR,
        "i/o error on /tmp/x: disk gone"
    )]
    fn test_executor_error_mapping(
        #[case] err: ExecutorError,
        #[case] status: StatusCode,
        #[case] message: &str,
    ) {
        let api: ApiError = err.into();
        assert_eq!(api.status, status);
        assert_eq!(api.body.error, message);
    }

    #[test]
    fn test_busy_carries_current_task() {
        let api: ApiError = ExecutorError::Busy(Box::new(TaskStatusRecord::running("t0"))).into();
        assert_eq!(api.body.current_task.unwrap().task_id, "t0");
    }
}
