//! Task endpoints.
//!
//! `POST /v1/tasks` schedules synchronously and returns once the task is
//! placed or has failed. `POST /v1/tasks/enqueue` only persists the task;
//! the dispatch worker places it later.

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use cloudagent_id::TaskId;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::api::error::ApiError;
use crate::scheduler::ScheduleOutcome;
use crate::state::AppState;
use crate::store::{NewTask, Priority, TaskFilter, TaskRecord, TaskStatus};

const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 500;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_task).get(list_tasks))
        .route("/enqueue", post(enqueue_task))
        .route("/{task_id}", get(get_task))
        .route("/{task_id}/cancel", post(cancel_task))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task: TaskRecord,
    pub outcome: ScheduleOutcome,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<TaskRecord>,
    /// Matching tasks before paging.
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

fn validate_new_task(new: &NewTask) -> Result<(), ApiError> {
    if new.instructions.trim().is_empty() {
        return Err(ApiError::bad_request(
            "invalid_instructions",
            "instructions must not be empty",
        ));
    }
    if let Some(options) = &new.options {
        options.validate()?;
    }
    Ok(())
}

fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::bad_request("invalid_task_id", format!("invalid task id: {e}")))
}

async fn submit_task(
    State(state): State<AppState>,
    payload: Result<Json<NewTask>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new) = payload?;
    validate_new_task(&new)?;

    // Placement runs detached from the request so a client disconnect cannot
    // abandon a task between the machine's accept and the store update.
    let scheduler = state.scheduler().clone();
    let (task, outcome) = tokio::spawn(async move { scheduler.submit(new).await })
        .await
        .map_err(|e| {
            error!(error = %e, "Scheduling task panicked");
            ApiError::internal("scheduler_error", "Task scheduling did not complete")
        })??;
    Ok((StatusCode::CREATED, Json(SubmitTaskResponse { task, outcome })))
}

async fn enqueue_task(
    State(state): State<AppState>,
    payload: Result<Json<NewTask>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new) = payload?;
    validate_new_task(&new)?;

    let task = state.scheduler().enqueue(new).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(state): State<AppState>,
    query: Result<Query<ListTasksQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let filter = TaskFilter {
        status: query.status,
        priority: query.priority,
        limit: Some(limit),
        offset,
        ..TaskFilter::default()
    };
    let total = state.store().count_tasks(&filter).await;
    let tasks = state.store().list_tasks(&filter).await;

    Ok(Json(ListTasksResponse {
        tasks,
        total,
        limit,
        offset,
    }))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_task_id(&task_id)?;
    let task = state.store().get_task(&id).await?;
    Ok(Json(task))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_task_id(&task_id)?;
    let outcome = state.scheduler().cancel(&id).await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudagent_wire::RunOptions;

    #[test]
    fn test_blank_instructions_rejected() {
        let err = validate_new_task(&NewTask::new("   ")).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_out_of_range_options_rejected() {
        let new = NewTask {
            options: Some(RunOptions {
                max_turns: 0,
                ..RunOptions::default()
            }),
            ..NewTask::new("do it")
        };
        let err = validate_new_task(&new).unwrap_err();
        assert_eq!(err.problem.code, "invalid_request");
    }

    #[test]
    fn test_bad_task_id() {
        assert!(parse_task_id("not-an-id").is_err());
        assert!(parse_task_id(&TaskId::new().to_string()).is_ok());
    }
}
