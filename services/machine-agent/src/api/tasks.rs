//! Task endpoints: run, status, list, cancel.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::header::{CACHE_CONTROL, CONTENT_TYPE},
    response::{IntoResponse, Response},
    Json,
};
use cloudagent_wire::{
    validate_task_id, RunTaskRequest, TaskListResponse, TaskStatusResponse, NDJSON_CONTENT_TYPE,
};
use futures_util::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;

use super::error::ApiError;
use crate::state::AppState;

/// `POST /tasks/run`: accept atomically, then stream progress as NDJSON.
pub async fn run(
    State(state): State<AppState>,
    payload: Result<Json<RunTaskRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    request
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    info!(task_id = %request.task_id, "Run requested");
    let events = state.executor().start(request)?;

    let body = UnboundedReceiverStream::new(events).map(|event| event.to_line());
    Ok((
        [
            (CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

pub async fn status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    validate_task_id(&task_id).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let task_status = state
        .store()
        .read_task(&task_id)?
        .ok_or_else(|| ApiError::not_found("Task not found"))?;
    Ok(Json(TaskStatusResponse { task_status }))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<TaskListResponse>, ApiError> {
    let tasks = state.store().list_tasks()?;
    Ok(Json(TaskListResponse { tasks }))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    validate_task_id(&task_id).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let task_status = state.executor().cancel(&task_id)?;
    Ok(Json(TaskStatusResponse { task_status }))
}
