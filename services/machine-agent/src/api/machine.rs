//! Machine-level endpoints: health, availability, clear.

use axum::{extract::State, Json};
use chrono::Utc;
use cloudagent_wire::{AvailabilityResponse, HealthResponse, MessageResponse};
use tracing::info;

use super::error::ApiError;
use crate::state::AppState;
use crate::status_store::Availability;

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
    })
}

pub async fn availability(
    State(state): State<AppState>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    let response = match state.executor().availability()? {
        Availability::Available => AvailabilityResponse {
            available: true,
            current_task: None,
        },
        Availability::Busy(task) => AvailabilityResponse {
            available: false,
            current_task: Some(task),
        },
    };
    Ok(Json(response))
}

pub async fn clear(State(state): State<AppState>) -> Result<Json<MessageResponse>, ApiError> {
    state.store().clear()?;
    info!("Machine status cleared on request");
    Ok(Json(MessageResponse {
        message: "Machine status cleared".to_string(),
    }))
}
