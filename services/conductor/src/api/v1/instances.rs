//! Instance field writes.

use axum::{
    extract::{Path, State},
    routing::patch,
    Json, Router,
};
use cirrus_id::InstanceId;

use crate::api::error::ApiError;
use crate::context::RequestContext;
use crate::model::Instance;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/{instance_id}", patch(update_instance))
}

/// Applies `vm_state`, `task_state`, `power_state`, `host`, `node` and the
/// optional `expected_task_state` guard. Other fields are rejected.
async fn update_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(instance_id): Path<String>,
    Json(fields): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<Json<Instance>, ApiError> {
    let request_id = ctx.request_id.to_string();
    let instance_id = InstanceId::parse(&instance_id).map_err(|_| {
        ApiError::bad_request("invalid_instance_id", "instance id must be a UUID")
            .with_request_id(request_id.clone())
    })?;

    let instance = state
        .manager()
        .instance_update(instance_id, &fields)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;
    Ok(Json(instance))
}
