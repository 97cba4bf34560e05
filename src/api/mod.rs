//! Ingestion API
//!
//! Accepts audio uploads, records them as assets and queues transcription
//! jobs for them.

use anyhow::Result;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::info;

pub mod error;
pub mod handlers;
pub mod models;
pub mod server;

pub use error::ApiError;
pub use models::{ErrorBody, JobAcceptedResponse, TranscriptionJob, TranscriptionRequest, VideoResponse};
pub use server::{create_router, AppState};

/// Bounded queue between the API and whatever runs transcription jobs
pub fn job_queue(
    capacity: usize,
) -> (mpsc::Sender<TranscriptionJob>, mpsc::Receiver<TranscriptionJob>) {
    mpsc::channel(capacity)
}

/// Ingestion server for handling upload and transcription requests
pub struct IngestionServer {
    state: AppState,
    addr: SocketAddr,
}

impl IngestionServer {
    pub fn new(state: AppState, addr: SocketAddr) -> Self {
        Self { state, addr }
    }

    /// Start the server
    pub async fn start(self) -> Result<()> {
        info!("🚀 Starting ingestion server on {}", self.addr);
        server::start_http_server(self.state, self.addr).await
    }
}
