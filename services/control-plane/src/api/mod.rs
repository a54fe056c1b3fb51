//! HTTP API handlers and routing.

pub mod error;
mod health;
mod v1;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use cloudagent_reconcile::RetryBudget;
    use tower::ServiceExt;

    use super::*;
    use crate::fleet::{FleetResult, FleetSource};
    use crate::machine::Machine;
    use crate::prober::HttpMachineApi;
    use crate::scheduler::TaskScheduler;
    use crate::store::RecordStore;

    struct NoFleet;

    #[async_trait::async_trait]
    impl FleetSource for NoFleet {
        async fn list(&self) -> FleetResult<Vec<Machine>> {
            Ok(Vec::new())
        }
    }

    fn router() -> Router {
        let scheduler = TaskScheduler::new(
            Arc::new(RecordStore::in_memory()),
            Arc::new(NoFleet),
            Arc::new(HttpMachineApi::new("sk_unused")),
            RetryBudget::default(),
        );
        create_router(AppState::new(Arc::new(scheduler)))
    }

    async fn status_of(method: &str, uri: &str) -> StatusCode {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        router().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_routes_are_mounted() {
        assert_eq!(status_of("GET", "/healthz").await, StatusCode::OK);
        assert_eq!(status_of("GET", "/livez").await, StatusCode::OK);
        assert_eq!(status_of("GET", "/v1/tasks").await, StatusCode::OK);
        assert_eq!(status_of("GET", "/v1/agents").await, StatusCode::OK);
        assert_eq!(status_of("GET", "/v1/machines").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        assert_eq!(status_of("GET", "/v1/nodes").await, StatusCode::NOT_FOUND);
        assert_eq!(
            status_of("DELETE", "/v1/tasks").await,
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
