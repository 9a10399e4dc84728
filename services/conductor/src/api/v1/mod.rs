//! API v1 routes.

mod compute_task;
mod instances;
mod migrations;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/compute-task", compute_task::routes())
        .nest("/migrations", migrations::routes())
        .nest("/instances", instances::routes())
}
