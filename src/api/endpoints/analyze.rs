//! `POST /analyze`: one film in, predictions and attribution overlay out.

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::Instrument;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::pipeline::AnalysisReport;

/// Multipart field carrying the image bytes.
pub const FILE_FIELD: &str = "file";

/// Run the full pipeline on the uploaded `file` field.
///
/// Inference is CPU-bound, so it runs on the blocking pool. The request span
/// (with its `request_id`) follows the work onto that thread.
pub async fn analyze(
    State(ctx): State<ApiContext>,
    mut multipart: Multipart,
) -> Result<Json<AnalysisReport>, ApiError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("analyze", %request_id);

    let image = read_file_field(&mut multipart, &ctx)
        .instrument(span.clone())
        .await?;

    let pipeline = ctx.pipeline.clone();
    let report = tokio::task::spawn_blocking(move || {
        let _guard = span.enter();
        pipeline.analyze(&image)
    })
    .await??;

    Ok(Json(report))
}

/// Pull the bytes of the first `file` field. Other fields are skipped.
async fn read_file_field(multipart: &mut Multipart, ctx: &ApiContext) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, ctx))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let bytes = field.bytes().await.map_err(|e| multipart_error(e, ctx))?;
        tracing::info!(filename = %filename, bytes = bytes.len(), "Upload received");
        return Ok(bytes.to_vec());
    }
    Err(ApiError::MissingFile(FILE_FIELD))
}

fn multipart_error(err: MultipartError, ctx: &ApiContext) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        tracing::warn!(limit_mb = ctx.max_upload_mb(), "Upload rejected: too large");
        return ApiError::PayloadTooLarge {
            limit_mb: ctx.max_upload_mb(),
        };
    }
    tracing::warn!(error = %err.body_text(), "Malformed multipart upload");
    ApiError::BadRequest(err.body_text())
}
