//! Machine endpoints.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::machine::Machine;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_machines))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListMachinesResponse {
    pub machines: Vec<Machine>,
}

/// Live view of the fleet, health-probed.
async fn list_machines(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let machines = state.fleet().list().await?;
    Ok(Json(ListMachinesResponse { machines }))
}
