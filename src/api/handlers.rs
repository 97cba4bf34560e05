//! API request handlers

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
        Multipart, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info};

use super::error::{ApiError, INVALID_FILE_TYPE, NO_FILE_UPLOADED};
use super::models::{JobAcceptedResponse, TranscriptionJob, TranscriptionRequest, VideoResponse};
use super::server::AppState;
use crate::state::AssetId;
use crate::storage::StorageError;

/// Handle health check requests
pub async fn health_check() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "vidscribe",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// `POST /videos`: validate, store and record one uploaded audio file.
///
/// The asset record is created only once the bytes are fully on disk.
#[tracing::instrument(skip(state, multipart))]
pub async fn upload_video(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<VideoResponse>, ApiError> {
    let mut multipart = multipart.map_err(|e| {
        debug!(error = %e, "Request is not multipart");
        ApiError::Validation(NO_FILE_UPLOADED.to_string())
    })?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(filename) = field.file_name().map(str::to_string) else {
            debug!(field = ?field.name(), "Skipping non-file field");
            continue;
        };

        let extension = std::path::Path::new(&filename)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();

        if !state.config.allowed_extensions.iter().any(|allowed| *allowed == extension) {
            return Err(ApiError::Validation(INVALID_FILE_TYPE.to_string()));
        }

        let limit = state.storage.max_file_bytes();
        let chunks = field.map(move |chunk| chunk.map_err(|e| storage_error(e, limit)));
        let stored = state.storage.write_stream(&filename, chunks).await?;
        upload = Some((filename, stored));
        break;
    }

    let (filename, stored) =
        upload.ok_or_else(|| ApiError::Validation(NO_FILE_UPLOADED.to_string()))?;

    // Exactly one file per request
    loop {
        match multipart.next_field().await {
            Ok(Some(extra)) if extra.file_name().is_some() => {
                state.storage.discard(&stored.path).await;
                return Err(ApiError::Validation("Only one file may be uploaded".to_string()));
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                state.storage.discard(&stored.path).await;
                return Err(multipart_error(e));
            }
        }
    }

    let video = match state.store.create_asset(&filename, &stored.path).await {
        Ok(asset) => asset,
        Err(e) => {
            state.storage.discard(&stored.path).await;
            return Err(e.into());
        }
    };

    info!(
        asset_id = %video.id,
        filename = %video.name,
        path = %video.path.display(),
        bytes = stored.bytes_written,
        "Audio upload stored"
    );

    Ok(Json(VideoResponse { video }))
}

/// `POST /videos/{id}/transcription`: accept a transcription job for a stored asset.
///
/// Responds once the job is queued; completion is not awaited.
#[tracing::instrument(skip(state, body))]
pub async fn request_transcription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<TranscriptionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    // A request without a JSON body carries no prompt; a broken one is refused
    let request = match body {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => TranscriptionRequest::default(),
        Err(rejection) => return Err(ApiError::Validation(rejection.body_text())),
    };

    let asset_id = AssetId::new(id);
    let asset = state.store.get_asset(&asset_id).await?.ok_or(ApiError::NotFound)?;

    let prompt = request
        .prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());

    let job = TranscriptionJob {
        asset_id: asset.id,
        prompt,
        requested_at: chrono::Utc::now(),
    };

    state
        .jobs
        .try_send(job.clone())
        .map_err(|_| ApiError::Unavailable)?;

    info!(asset_id = %job.asset_id, prompt = ?job.prompt, "Transcription job accepted");

    Ok((StatusCode::ACCEPTED, Json(JobAcceptedResponse { job })))
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge
    } else {
        ApiError::Validation(err.body_text())
    }
}

fn storage_error(err: MultipartError, limit: u64) -> StorageError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        StorageError::TooLarge { limit }
    } else {
        StorageError::Stream(err.body_text())
    }
}
