// Common types and utilities for API handlers

use axum::{http::StatusCode, response::Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::{MigrationError, SnapshotError};

// Helper types for API responses
pub type ApiError = (StatusCode, Json<ApiResponse<()>>);
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ApiResponse::error(message.into())))
}

pub fn snapshot_status(err: &SnapshotError) -> StatusCode {
    match err {
        SnapshotError::NotFound { .. } | SnapshotError::ChunkOutOfRange { .. } => {
            StatusCode::NOT_FOUND
        }
        SnapshotError::UnsupportedFormat { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn migration_status(err: &MigrationError) -> StatusCode {
    match err {
        MigrationError::NoActiveMigration
        | MigrationError::NotRecorded { .. }
        | MigrationError::ChunkOutOfRange { .. } => StatusCode::NOT_FOUND,
        MigrationError::HeightOutOfWindow { .. } | MigrationError::InvalidWindow { .. } => {
            StatusCode::BAD_REQUEST
        }
        MigrationError::Snapshot(inner) => snapshot_status(inner),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
