//! Operator endpoints.
//!
//! - `GET /admin/tenants` - List shard assignments
//! - `PUT /admin/tenants/{tenant}/shard` - Assign a tenant to a shard
//! - `POST /admin/shards/{shard}/activate` - Run pending migrations on a shard
//! - `POST /admin/shards/{shard}/clear-failure` - Lift a migration failure and retry
//! - `GET /admin/subscriptions/{id}/sessions` - Live sessions of a subscription

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use medrepo_core::ShardId;
use medrepo_storage::StorageEngine;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/tenants", get(list_tenants))
        .route("/admin/tenants/{tenant}/shard", put(assign_tenant))
        .route("/admin/shards/{shard}/activate", post(activate_shard))
        .route("/admin/shards/{shard}/clear-failure", post(clear_failure))
        .route("/admin/subscriptions/{id}/sessions", get(list_sessions))
}

fn parse_shard(raw: &str) -> ApiResult<ShardId> {
    ShardId::new(raw).map_err(|e| ApiError::bad_request(e.to_string()))
}

async fn list_tenants(State(state): State<AppState>) -> ApiResult<Response> {
    let mut assignments = state.services.repository.router().list_assignments().await?;
    assignments.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
    Ok(Json(assignments).into_response())
}

#[derive(Debug, Deserialize)]
pub struct AssignTenantRequest {
    pub shard: String,
}

async fn assign_tenant(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(body): Json<AssignTenantRequest>,
) -> ApiResult<Response> {
    let shard = parse_shard(&body.shard)?;
    let assignment = state
        .services
        .repository
        .router()
        .assign_tenant(&tenant, shard)
        .await?;
    Ok(Json(assignment).into_response())
}

async fn run_activation(state: &AppState, shard: &ShardId) -> ApiResult<Response> {
    match state
        .services
        .activator
        .activate(shard, &state.services.shutdown)
        .await
    {
        Ok(version) => {
            info!(shard = %shard, version, "Shard activated by operator");
            let body = json!({
                "shard": shard.as_str(),
                "state": state.services.board.state(shard).to_string(),
            });
            Ok(Json(body).into_response())
        }
        Err(e) => {
            warn!(shard = %shard, error = %e, "Operator activation failed");
            Err(ApiError::Unavailable(e.to_string()))
        }
    }
}

async fn activate_shard(
    State(state): State<AppState>,
    Path(shard): Path<String>,
) -> ApiResult<Response> {
    let shard = parse_shard(&shard)?;
    if !state.services.repository.engine().has_shard(&shard) {
        return Err(ApiError::not_found(format!("shard {shard} is not provisioned")));
    }
    run_activation(&state, &shard).await
}

async fn clear_failure(
    State(state): State<AppState>,
    Path(shard): Path<String>,
) -> ApiResult<Response> {
    let shard = parse_shard(&shard)?;
    if !state.services.board.clear_failure(&shard) {
        return Err(ApiError::bad_request(format!(
            "shard {shard} has no migration failure"
        )));
    }
    run_activation(&state, &shard).await
}

async fn list_sessions(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.services.dispatcher.sessions_for(&id)))
}
