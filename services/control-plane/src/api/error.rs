use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use cloudagent_wire::WireError;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::fleet::FleetError;
use crate::scheduler::SchedulerError;
use crate::store::StoreError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("urn:cloudagent:problem:{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::NotFound { kind, .. } => Self::not_found(format!("{kind}_not_found"), e.to_string()),
            StoreError::Conflict(_) => Self::conflict("conflict", e.to_string()),
            StoreError::InvalidTransition { .. } => {
                Self::conflict("invalid_transition", e.to_string())
            }
            StoreError::Io { .. } | StoreError::Corrupt { .. } => {
                error!(error = %e, "Record store failure");
                Self::internal("store_error", "Record store failure")
            }
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        error!(error = %e, "Fleet listing failed");
        Self::bad_gateway("fleet_unavailable", e.to_string())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Store(e) => e.into(),
            SchedulerError::Fleet(e) => e.into(),
        }
    }
}

impl From<WireError> for ApiError {
    fn from(e: WireError) -> Self {
        Self::bad_request("invalid_request", e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::bad_request("invalid_body", e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::bad_request("invalid_query", e.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudagent_id::TaskId;

    use crate::store::TaskStatus;

    #[test]
    fn test_store_errors_map_to_statuses() {
        let not_found: ApiError = StoreError::NotFound {
            kind: "task",
            id: "tsk_x".to_string(),
        }
        .into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);
        assert_eq!(not_found.problem.code, "task_not_found");

        let transition: ApiError = StoreError::InvalidTransition {
            id: TaskId::new(),
            from: TaskStatus::Completed,
            to: TaskStatus::Cancelled,
        }
        .into();
        assert_eq!(transition.status, StatusCode::CONFLICT);
    }

    #[test]
    fn test_problem_content_type() {
        let response = ApiError::bad_request("invalid", "nope").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "application/problem+json"
        );
    }
}
