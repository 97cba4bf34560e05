//! vidscribe - video to transcript pipeline
//!
//! Client side: converts a video to low bitrate MP3, uploads it and requests a
//! transcription job, reporting progress through a status machine.
//! Server side: an HTTP ingestion service that stores uploaded audio as
//! assets and queues transcription jobs for them.

pub mod api;
pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod state;
pub mod storage;
pub mod workflow;

// Re-export main types for easy access
pub use crate::api::{create_router, AppState, IngestionServer, TranscriptionJob};
pub use crate::audio::{AudioConverter, AudioTranscoder, FfmpegEngine, MediaEngine};
pub use crate::client::{ApiClient, AssetUploader, TranscriptionTrigger};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{ConversionError, WorkflowError};
pub use crate::state::{Asset, AssetId, AssetStore, InMemoryAssetStore, JsonAssetStore};
pub use crate::storage::UploadStorage;
pub use crate::workflow::{SubmitOutcome, VideoFile, Workflow, WorkflowStatus};
