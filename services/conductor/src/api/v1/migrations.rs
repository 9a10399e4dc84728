//! Migration progress reports.

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use cirrus_id::MigrationId;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::context::RequestContext;
use crate::model::{MigrationRecord, MigrationStatus};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/{migration_id}/progress", post(record_progress))
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub status: MigrationStatus,
}

async fn record_progress(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(migration_id): Path<String>,
    Json(body): Json<ProgressRequest>,
) -> Result<Json<MigrationRecord>, ApiError> {
    let request_id = ctx.request_id.to_string();
    let migration_id = MigrationId::parse(&migration_id).map_err(|_| {
        ApiError::bad_request("invalid_migration_id", "migration id must be a UUID")
            .with_request_id(request_id.clone())
    })?;

    let record = state
        .manager()
        .record_migration_progress(migration_id, body.status)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;
    Ok(Json(record))
}
