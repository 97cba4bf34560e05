//! API data models, shared by the server and the HTTP clients

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{Asset, AssetId};

/// Body of a successful `POST /videos`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoResponse {
    pub video: Asset,
}

/// Body of every error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Body of `POST /videos/{id}/transcription`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionRequest {
    /// Free-text hint for the transcription engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// A transcription job accepted for an asset. Completion is tracked elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionJob {
    pub asset_id: AssetId,
    pub prompt: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// Body of a `202 Accepted` transcription response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAcceptedResponse {
    pub job: TranscriptionJob,
}
