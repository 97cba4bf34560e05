//! HTTP error responses for the ingestion API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use super::models::ErrorBody;
use crate::state::StoreError;
use crate::storage::StorageError;

pub const NO_FILE_UPLOADED: &str = "No file uploaded";
pub const INVALID_FILE_TYPE: &str = "Invalid file type";
pub const FILE_TOO_LARGE: &str = "File too large";
pub const VIDEO_NOT_FOUND: &str = "Video not found";

#[derive(Error, Debug)]
pub enum ApiError {
    /// Client mistakes reported verbatim
    #[error("{0}")]
    Validation(String),

    #[error("{}", FILE_TOO_LARGE)]
    PayloadTooLarge,

    #[error("{}", VIDEO_NOT_FOUND)]
    NotFound,

    #[error("Transcription queue unavailable")]
    Unavailable,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::TooLarge { .. } => ApiError::PayloadTooLarge,
            StorageError::Stream(message) => ApiError::Validation(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::warn!(error = %self, status = status.as_u16(), "Request rejected");
        }

        // Internal details stay in the logs
        let message = match &self {
            ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        (status, Json(ErrorBody::new(message))).into_response()
    }
}
