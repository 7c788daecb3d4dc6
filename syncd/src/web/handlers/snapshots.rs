// Snapshot endpoints queried by joining nodes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use std::sync::Arc;
use tracing::{debug, error};

use super::common::{api_error, snapshot_status, ApiError, ApiResponse, ApiResult};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::web::AppState;

fn store(state: &AppState) -> Result<&Arc<SnapshotStore>, ApiError> {
    state
        .snapshots
        .as_ref()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "snapshots are not enabled on this node"))
}

/// Snapshot metadata at a height
pub async fn get_snapshot_at_height(
    Path(height): Path<u64>,
    State(state): State<AppState>,
) -> ApiResult<Snapshot> {
    match store(&state)?.snapshot_at(height).await {
        Some(snapshot) => Ok(Json(ApiResponse::success(snapshot))),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no snapshot at height {}", height),
        )),
    }
}

/// Highest retained snapshot
pub async fn get_latest_snapshot(State(state): State<AppState>) -> ApiResult<Snapshot> {
    match store(&state)?.latest_snapshot().await {
        Some(snapshot) => Ok(Json(ApiResponse::success(snapshot))),
        None => Err(api_error(StatusCode::NOT_FOUND, "no snapshots available")),
    }
}

/// Every retained snapshot, lowest height first
pub async fn list_snapshots(State(state): State<AppState>) -> ApiResult<Vec<Snapshot>> {
    Ok(Json(ApiResponse::success(store(&state)?.list_snapshots().await)))
}

/// Raw bytes of one snapshot chunk
pub async fn get_snapshot_chunk(
    Path((height, format, index)): Path<(u64, u32, u32)>,
    State(state): State<AppState>,
) -> Result<Vec<u8>, ApiError> {
    debug!("Snapshot chunk {} at height {} requested", index, height);
    store(&state)?
        .load_snapshot_chunk(height, format, index)
        .await
        .map_err(|e| {
            let status = snapshot_status(&e);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!("Failed to load snapshot chunk {} at height {}: {}", index, height, e);
            }
            api_error(status, e.to_string())
        })
}
