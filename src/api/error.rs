//! API error types with `{"detail": ...}` JSON bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::pipeline::PipelineError;

/// Message returned for every server-side failure. Details stay in the logs.
pub const INTERNAL_DETAIL: &str = "Internal server error";

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing multipart field '{0}'")]
    MissingFile(&'static str),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Upload exceeds {limit_mb}MB limit")]
    PayloadTooLarge { limit_mb: usize },
    #[error("Internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ApiError::MissingFile(field) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Field '{field}' is required"),
            ),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail.clone()),
            ApiError::PayloadTooLarge { limit_mb } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Upload exceeds {limit_mb}MB limit"),
            ),
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_DETAIL.to_string())
            }
            // Already logged with its stage by the pipeline.
            ApiError::Pipeline(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_DETAIL.to_string())
            }
        };

        (status, Json(ErrorBody { detail })).into_response()
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("analysis task failed: {err}"))
    }
}
