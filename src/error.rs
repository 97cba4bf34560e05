//! Error types shared by the client-side workflow stages.

use thiserror::Error;

/// Failures raised by the media engine while turning a video into audio.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("Media engine failed to initialize: {0}")]
    EngineInit(String),

    #[error("Media engine I/O error: {0}")]
    Io(String),

    #[error("Media engine exited with {status}: {stderr}")]
    Exec { status: String, stderr: String },

    #[error("Media engine produced no audio output")]
    EmptyOutput,

    #[error("Media engine output is not a valid MP3 stream")]
    InvalidOutput,

    #[error("Media engine has been torn down")]
    TornDown,
}

impl From<std::io::Error> for ConversionError {
    fn from(err: std::io::Error) -> Self {
        ConversionError::Io(err.to_string())
    }
}

/// Everything that can end a workflow run early.
///
/// Cloneable so the failed status can carry the cause to every subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// The server rejected the upload as malformed (missing file, wrong type).
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    SizeLimit(String),

    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Upload rejected ({status}): {message}")]
    Upload { status: u16, message: String },

    #[error("Transcription request rejected ({status}): {message}")]
    JobTrigger { status: u16, message: String },

    #[error("Stage '{stage}' timed out after {secs}s")]
    Timeout { stage: &'static str, secs: u64 },

    /// The caller stopped waiting before the run finished
    #[error("Workflow run was cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for WorkflowError {
    fn from(err: reqwest::Error) -> Self {
        WorkflowError::Transport(err.to_string())
    }
}

impl WorkflowError {
    /// Errors the user can fix by picking a different file.
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, WorkflowError::Validation(_) | WorkflowError::SizeLimit(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_is_verbatim() {
        let err = WorkflowError::Validation("Invalid file type".to_string());
        assert_eq!(err.to_string(), "Invalid file type");
        assert!(err.is_user_correctable());
    }

    #[test]
    fn test_conversion_error_wraps() {
        let err: WorkflowError = ConversionError::EmptyOutput.into();
        assert!(matches!(err, WorkflowError::Conversion(ConversionError::EmptyOutput)));
        assert!(!err.is_user_correctable());
    }
}
