// Migration endpoints consumed by the successor chain

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use std::sync::Arc;
use tracing::error;

use super::common::{api_error, migration_status, ApiError, ApiResponse, ApiResult};
use crate::errors::MigrationError;
use crate::migrations::{ChangesetMetadata, MigrationMetadata, Migrator};
use crate::web::AppState;

fn migrator(state: &AppState) -> Result<&Arc<Migrator>, ApiError> {
    state
        .migrator
        .as_ref()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "migrations are not enabled on this node"))
}

fn to_api_error(context: &str, err: MigrationError) -> ApiError {
    let status = migration_status(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("{}: {}", context, err);
    }
    api_error(status, err.to_string())
}

/// Window, genesis snapshot and genesis parameters
pub async fn get_migration_metadata(State(state): State<AppState>) -> ApiResult<MigrationMetadata> {
    migrator(&state)?
        .migration_metadata()
        .await
        .map(|metadata| Json(ApiResponse::success(metadata)))
        .map_err(|e| to_api_error("Failed to read migration metadata", e))
}

/// Raw bytes of one genesis snapshot chunk
pub async fn get_genesis_chunk(
    Path((format, index)): Path<(u32, u32)>,
    State(state): State<AppState>,
) -> Result<Vec<u8>, ApiError> {
    let migrator = migrator(&state)?;
    let window = migrator
        .active_window()
        .await
        .ok_or_else(|| to_api_error("Genesis chunk", MigrationError::NoActiveMigration))?;

    migrator
        .genesis_snapshot_chunk(window.start_height, format, index)
        .await
        .map_err(|e| to_api_error("Failed to load genesis chunk", e))
}

pub async fn get_changeset_metadata(
    Path(height): Path<u64>,
    State(state): State<AppState>,
) -> ApiResult<ChangesetMetadata> {
    migrator(&state)?
        .changeset_metadata(height)
        .await
        .map(|metadata| Json(ApiResponse::success(metadata)))
        .map_err(|e| to_api_error("Failed to read changeset metadata", e))
}

/// Raw bytes of one stored changeset chunk
pub async fn get_changeset_chunk(
    Path((height, index)): Path<(u64, u32)>,
    State(state): State<AppState>,
) -> Result<Vec<u8>, ApiError> {
    migrator(&state)?
        .changeset_chunk(height, index)
        .await
        .map_err(|e| to_api_error("Failed to load changeset chunk", e))
}
