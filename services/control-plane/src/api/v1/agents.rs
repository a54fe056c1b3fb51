//! Agent endpoints.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use cloudagent_wire::options::{MAX_TURNS, MIN_TURNS};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::state::AppState;
use crate::store::{AgentRecord, NewAgent};

pub fn routes() -> Router<AppState> {
    Router::new().route("/", post(create_agent).get(list_agents))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListAgentsResponse {
    pub agents: Vec<AgentRecord>,
}

async fn create_agent(
    State(state): State<AppState>,
    payload: Result<Json<NewAgent>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new) = payload?;

    if new.name.trim().is_empty() {
        return Err(ApiError::bad_request("invalid_name", "name must not be empty"));
    }
    // Tasks inherit this, so an out-of-range value would fail every delegation.
    if let Some(max_turns) = new.max_turns {
        if !(MIN_TURNS..=MAX_TURNS).contains(&max_turns) {
            return Err(ApiError::bad_request(
                "invalid_max_turns",
                format!("maxTurns must be between {MIN_TURNS} and {MAX_TURNS}"),
            ));
        }
    }

    let agent = state.store().create_agent(new).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(ListAgentsResponse {
        agents: state.store().list_agents().await,
    })
}
