use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::api::models::{ErrorBody, TranscriptionRequest, VideoResponse};
use crate::error::WorkflowError;
use crate::state::{Asset, AssetId};

/// Sends converted audio to the ingestion service.
#[async_trait]
pub trait AssetUploader: Send + Sync {
    async fn upload(&self, audio: Vec<u8>, filename: &str) -> Result<Asset, WorkflowError>;
}

/// Requests a transcription job and waits for acceptance only.
#[async_trait]
pub trait TranscriptionTrigger: Send + Sync {
    async fn trigger(&self, asset_id: &AssetId, prompt: Option<&str>) -> Result<(), WorkflowError>;
}

/// HTTP client for the ingestion API
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, WorkflowError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| WorkflowError::Transport(format!("invalid server URL '{}': {}", base_url, e)))?;

        // No overall request timeout: stage timeouts are the workflow's call.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self { base_url, client })
    }

    /// Build `{base}/{segments...}`, percent-encoding each segment
    fn endpoint(&self, segments: &[&str]) -> Result<Url, WorkflowError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| WorkflowError::Transport(format!("server URL '{}' cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Upload audio as the single `file` field of a multipart form
    pub async fn upload_audio(&self, audio: Vec<u8>, filename: &str) -> Result<Asset, WorkflowError> {
        let url = self.endpoint(&["videos"])?;
        let size = audio.len();

        let part = Part::bytes(audio)
            .file_name(filename.to_string())
            .mime_str("audio/mpeg")?;
        let form = Form::new().part("file", part);

        info!("📤 Uploading {} ({:.1} KB) to {}", filename, size as f64 / 1024.0, url);

        let response = self.client.post(url).multipart(form).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = error_message(response).await;
            return Err(match status {
                StatusCode::BAD_REQUEST => WorkflowError::Validation(message),
                StatusCode::PAYLOAD_TOO_LARGE => WorkflowError::SizeLimit(message),
                _ => WorkflowError::Upload {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        let body: VideoResponse = response.json().await?;
        info!("✅ Upload stored as asset {}", body.video.id);
        Ok(body.video)
    }

    /// Ask the server to queue transcription of an uploaded asset
    pub async fn trigger_transcription(
        &self,
        asset_id: &AssetId,
        prompt: Option<&str>,
    ) -> Result<(), WorkflowError> {
        let url = self.endpoint(&["videos", asset_id.as_str(), "transcription"])?;
        let request = TranscriptionRequest {
            prompt: prompt.map(str::to_string),
        };

        debug!("Requesting transcription at {}", url);
        let response = self.client.post(url).json(&request).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(WorkflowError::JobTrigger {
                status: status.as_u16(),
                message: error_message(response).await,
            });
        }

        info!("📝 Transcription job accepted for asset {}", asset_id);
        Ok(())
    }
}

/// Server-provided `message`, falling back to the raw body or status text
async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => body.message,
        Err(_) if !text.trim().is_empty() => text.trim().to_string(),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    }
}

#[async_trait]
impl AssetUploader for ApiClient {
    async fn upload(&self, audio: Vec<u8>, filename: &str) -> Result<Asset, WorkflowError> {
        self.upload_audio(audio, filename).await
    }
}

#[async_trait]
impl TranscriptionTrigger for ApiClient {
    async fn trigger(&self, asset_id: &AssetId, prompt: Option<&str>) -> Result<(), WorkflowError> {
        self.trigger_transcription(asset_id, prompt).await
    }
}
