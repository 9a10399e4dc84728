//! HTTP API.
//!
//! - `/healthz`, `/readyz`, `/livez`
//! - `/v1/compute-task/*` orchestration entry points
//! - `/v1/migrations/{id}/progress` progress reports from compute agents
//! - `/v1/instances/{id}` whitelisted field writes

pub mod error;
pub mod health;
pub mod request_context;
pub mod v1;

use axum::http::{header, Method};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
