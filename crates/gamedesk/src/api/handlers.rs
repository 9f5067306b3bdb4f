//! HTTP request handlers.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

use crate::instance::{CreateInstanceRequest, Instance, InstanceConfigOverrides};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Owner used when a create request names none.
pub const DEFAULT_USER_ID: &str = "default";

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Query parameters for listing instances.
#[derive(Debug, Default, Deserialize)]
pub struct ListInstancesQuery {
    pub user_id: Option<String>,
}

/// List instances, newest first.
#[instrument(skip(state))]
pub async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<ListInstancesQuery>,
) -> ApiResult<Json<Vec<Instance>>> {
    let instances = state
        .instances
        .list_instances(query.user_id.as_deref())
        .await?;
    info!(count = instances.len(), "Listed instances");
    Ok(Json(instances))
}

/// Response from instance creation.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateInstanceResponse {
    pub instance_id: String,
    pub instance: Instance,
}

/// Create a new instance.
///
/// Unreadable bodies get the same structured 400 as invalid configs.
#[instrument(skip(state, payload))]
pub async fn create_instance(
    State(state): State<AppState>,
    payload: Result<Json<CreateInstanceRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreateInstanceResponse>)> {
    let Json(request) = payload?;
    let user_id = request
        .user_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_USER_ID.to_string());
    let overrides = InstanceConfigOverrides::from_json(request.config.unwrap_or(Value::Null))
        .map_err(ApiError::bad_request)?;

    let instance = state.instances.create_instance(&user_id, overrides).await?;
    info!(
        instance_id = %instance.id,
        user_id = %user_id,
        novnc_port = instance.novnc_port,
        "Created instance"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateInstanceResponse {
            instance_id: instance.id.clone(),
            instance,
        }),
    ))
}

/// Instance detail view. Records the access time.
#[instrument(skip(state))]
pub async fn get_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<Instance>> {
    let instance = state.instances.view_instance(&instance_id).await?;
    Ok(Json(instance))
}

/// Response from instance deletion.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteInstanceResponse {
    pub success: bool,
    pub warnings: Vec<String>,
}

/// Delete an instance.
#[instrument(skip(state))]
pub async fn delete_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<DeleteInstanceResponse>> {
    let report = state.instances.delete_instance(&instance_id).await?;
    info!(
        instance_id = %instance_id,
        warnings = report.warnings.len(),
        "Deleted instance"
    );

    Ok(Json(DeleteInstanceResponse {
        success: true,
        warnings: report.warnings,
    }))
}
