//! Application state shared across request handlers.

use std::sync::Arc;

use crate::scheduler::SchedulerHandle;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    scheduler: SchedulerHandle,
}

impl AppState {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self {
            inner: Arc::new(AppStateInner { scheduler }),
        }
    }

    /// Handle to the scheduler core.
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.inner.scheduler
    }
}
