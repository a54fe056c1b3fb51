//! HTTP boundary of the machine agent.

pub mod error;
mod auth;
mod machine;
mod tasks;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use cloudagent_wire::paths;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the router. Everything except `/health` requires the shared key.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(paths::AVAILABILITY, get(machine::availability))
        .route(paths::CLEAR, post(machine::clear))
        .route(paths::RUN, post(tasks::run))
        .route(paths::TASKS, get(tasks::list))
        .route("/tasks/{task_id}/status", get(tasks::status))
        .route("/tasks/{task_id}/cancel", post(tasks::cancel))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .route(paths::HEALTH, get(machine::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
