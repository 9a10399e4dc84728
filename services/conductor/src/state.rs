//! Application state shared across request handlers.

use std::sync::Arc;

use crate::coordinator::ComputeTaskManager;
use crate::db::Database;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    manager: ComputeTaskManager,
    db: Option<Database>,
}

impl AppState {
    pub fn new(manager: ComputeTaskManager, db: Option<Database>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { manager, db }),
        }
    }

    pub fn manager(&self) -> &ComputeTaskManager {
        &self.inner.manager
    }

    /// `None` when running on the in-memory store.
    pub fn db(&self) -> Option<&Database> {
        self.inner.db.as_ref()
    }
}
