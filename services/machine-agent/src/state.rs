//! Shared application state.

use std::sync::Arc;

use crate::executor::Executor;
use crate::status_store::StatusStore;

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    executor: Arc<Executor>,
    api_key: String,
}

impl AppState {
    pub fn new(executor: Arc<Executor>, api_key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                executor,
                api_key: api_key.into(),
            }),
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.inner.executor
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        self.inner.executor.store()
    }

    pub fn api_key(&self) -> &str {
        &self.inner.api_key
    }
}
