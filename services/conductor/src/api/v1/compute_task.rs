//! Orchestration entry points.
//!
//! `migrate-server` runs to completion within the request. The other
//! operations are accepted once their payload resolves and run in the
//! background; their outcome is visible through instance state and
//! notifications.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use cirrus_id::{MigrationId, RequestId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::context::RequestContext;
use crate::coordinator::{
    BuildInstancesBody, MigrateServerBody, RebuildInstanceBody, UnshelveInstanceBody,
};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/migrate-server", post(migrate_server))
        .route("/build-instances", post(build_instances))
        .route("/rebuild-instance", post(rebuild_instance))
        .route("/unshelve-instance", post(unshelve_instance))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MigrateServerResponse {
    /// Set for live migrations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_id: Option<MigrationId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub request_id: RequestId,
}

async fn migrate_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<MigrateServerBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id.to_string();
    let services = state.manager().services();
    let request = body
        .normalize(&*services.instances, &*services.flavors)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;

    let migration_id = state
        .manager()
        .migrate_server(&ctx, request)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;

    Ok(Json(MigrateServerResponse { migration_id }))
}

async fn build_instances(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<BuildInstancesBody>,
) -> Result<impl IntoResponse, ApiError> {
    let services = state.manager().services();
    let request = body
        .normalize(&*services.instances, &*services.flavors)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.to_string()))?;

    let manager = state.manager().clone();
    tokio::spawn(async move {
        let summary = manager.build_instances(&ctx, request).await;
        info!(
            request_id = %ctx.request_id,
            dispatched = summary.dispatched,
            skipped = summary.skipped,
            failed = summary.failed,
            "build_instances finished"
        );
    });

    Ok(accepted(ctx))
}

async fn rebuild_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<RebuildInstanceBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body
        .normalize(&*state.manager().services().instances)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.to_string()))?;

    let manager = state.manager().clone();
    tokio::spawn(async move {
        let instance_id = request.instance.uuid;
        if let Err(e) = manager.rebuild_instance(&ctx, request).await {
            warn!(request_id = %ctx.request_id, instance_id = %instance_id, error = %e, "rebuild_instance failed");
        }
    });

    Ok(accepted(ctx))
}

async fn unshelve_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<UnshelveInstanceBody>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = body
        .instance
        .resolve(&*state.manager().services().instances)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.to_string()))?;

    let manager = state.manager().clone();
    tokio::spawn(async move {
        let instance_id = instance.uuid;
        if let Err(e) = manager.unshelve_instance(&ctx, instance).await {
            warn!(request_id = %ctx.request_id, instance_id = %instance_id, error = %e, "unshelve_instance failed");
        }
    });

    Ok(accepted(ctx))
}

fn accepted(ctx: RequestContext) -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            request_id: ctx.request_id,
        }),
    )
}
