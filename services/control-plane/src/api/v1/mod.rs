//! API v1 routes.

mod agents;
mod machines;
mod tasks;

use axum::Router;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/tasks", tasks::routes())
        .nest("/machines", machines::routes())
        .nest("/agents", agents::routes())
}
