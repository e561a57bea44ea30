//! API error types with HTTP status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use vmdisk_protocol::{errno, MountStatus, MountStep};

use crate::error::Error;

/// API error type with HTTP status code mapping.
#[derive(Debug)]
pub enum ApiError {
    /// Disk not found (404).
    NotFound(String),
    /// Disk in use or mount name taken (409).
    Conflict(String),
    /// Bad request - invalid input (400).
    BadRequest(String),
    /// A mount or unmount stage failed (422, or 409 for name collisions).
    Stage {
        /// Error message.
        message: String,
        /// `{result, step}` of the failure.
        status: MountStatus,
    },
    /// Internal server error (500).
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error message.
    pub error: String,
    /// Machine-readable error class.
    pub code: String,
    /// Negative errno of a failed stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<i32>,
    /// Code of the failed stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut stage = None;
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Stage { message, status } => {
                stage = Some(status);
                if is_collision(&status) {
                    (StatusCode::CONFLICT, "CONFLICT", message)
                } else {
                    (StatusCode::UNPROCESSABLE_ENTITY, "STAGE_FAILED", message)
                }
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        let body = Json(ErrorBody {
            error: message,
            code: code.to_string(),
            result: stage.map(|s| s.result),
            step: stage.map(|s| s.step.code()),
        });

        (status, body).into_response()
    }
}

fn is_collision(status: &MountStatus) -> bool {
    status.step == MountStep::ResolveMountpoint && status.result == -errno::EEXIST
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match &err {
            Error::DiskNotFound { .. } => ApiError::NotFound(err.to_string()),
            Error::DiskInUse { .. } => ApiError::Conflict(err.to_string()),
            Error::MountFailed(_) | Error::UnmountFailed(_) => ApiError::Stage {
                message: err.to_string(),
                status: err.status(),
            },
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("task failed: {}", err))
    }
}
