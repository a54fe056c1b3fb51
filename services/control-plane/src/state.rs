//! Application state shared across request handlers.

use std::sync::Arc;

use crate::fleet::FleetSource;
use crate::scheduler::TaskScheduler;
use crate::store::RecordStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    scheduler: Arc<TaskScheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { scheduler }),
        }
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.inner.scheduler
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        self.inner.scheduler.store()
    }

    pub fn fleet(&self) -> &Arc<dyn FleetSource> {
        self.inner.scheduler.fleet()
    }
}
