//! Convert → upload → trigger pipeline behind a forward-only status machine.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::audio::AudioConverter;
use crate::client::{AssetUploader, TranscriptionTrigger};
use crate::error::WorkflowError;
use crate::state::AssetId;

const STATUS_CHANNEL_CAPACITY: usize = 16;
const FALLBACK_AUDIO_NAME: &str = "audio.mp3";

/// Observable state of one workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    Waiting,
    Converting,
    Uploading,
    Generating,
    Success(AssetId),
    Failed(WorkflowError),
}

impl WorkflowStatus {
    pub fn label(&self) -> &'static str {
        match self {
            WorkflowStatus::Waiting => "waiting",
            WorkflowStatus::Converting => "converting",
            WorkflowStatus::Uploading => "uploading",
            WorkflowStatus::Generating => "generating",
            WorkflowStatus::Success(_) => "success",
            WorkflowStatus::Failed(_) => "failed",
        }
    }

    /// Short progress text for display
    pub fn message(&self) -> &'static str {
        match self {
            WorkflowStatus::Waiting => "Waiting for a video",
            WorkflowStatus::Converting => "Converting...",
            WorkflowStatus::Uploading => "Uploading...",
            WorkflowStatus::Generating => "Generating...",
            WorkflowStatus::Success(_) => "Success!",
            WorkflowStatus::Failed(_) => "Failed",
        }
    }

    /// A run is in progress
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Converting | WorkflowStatus::Uploading | WorkflowStatus::Generating
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Success(_) | WorkflowStatus::Failed(_))
    }

    /// The transition table. Everything not listed is rejected.
    pub fn can_transition_to(&self, next: &WorkflowStatus) -> bool {
        use WorkflowStatus::*;

        match (self, next) {
            (Waiting, Converting) => true,
            (Converting, Uploading) => true,
            (Uploading, Generating) => true,
            (Generating, Success(_)) => true,
            (Converting | Uploading | Generating, Failed(_)) => true,
            (Success(_) | Failed(_), Waiting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Success(id) => write!(f, "success ({})", id),
            WorkflowStatus::Failed(err) => write!(f, "failed: {}", err),
            other => f.write_str(other.label()),
        }
    }
}

/// A video held in memory for one run
#[derive(Debug, Clone, Default)]
pub struct VideoFile {
    name: String,
    bytes: Vec<u8>,
}

impl VideoFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self::new(name, bytes))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Upload name for the converted audio: `clip.mp4` becomes `clip.mp3`
    pub fn audio_filename(&self) -> String {
        match Path::new(&self.name).file_stem() {
            Some(stem) if !stem.is_empty() => format!("{}.mp3", stem.to_string_lossy()),
            _ => FALLBACK_AUDIO_NAME.to_string(),
        }
    }
}

/// Result of a submit action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Nothing selected, or a run is already underway
    Ignored,
    Completed(AssetId),
    Failed(WorkflowError),
}

type CompletionCallback = Box<dyn Fn(&AssetId) + Send + Sync>;

struct Inner {
    status: WorkflowStatus,
    file: Option<VideoFile>,
}

/// Drives one video through conversion, upload and job trigger.
///
/// At most one run is active per instance: submit only starts a run from
/// `Waiting`, and the check and the move to `Converting` happen under one lock.
pub struct Workflow {
    converter: Arc<dyn AudioConverter>,
    uploader: Arc<dyn AssetUploader>,
    trigger: Arc<dyn TranscriptionTrigger>,
    stage_timeout: Option<Duration>,
    on_complete: Option<CompletionCallback>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<WorkflowStatus>,
}

impl Workflow {
    pub fn new(
        converter: Arc<dyn AudioConverter>,
        uploader: Arc<dyn AssetUploader>,
        trigger: Arc<dyn TranscriptionTrigger>,
    ) -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Self {
            converter,
            uploader,
            trigger,
            stage_timeout: None,
            on_complete: None,
            inner: Mutex::new(Inner {
                status: WorkflowStatus::Waiting,
                file: None,
            }),
            events,
        }
    }

    /// Fail a stage that runs longer than `timeout`
    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Called with the asset id once per successful run
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&AssetId) + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Inner holds plain data, so a poisoned lock is still consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> WorkflowStatus {
        self.lock().status.clone()
    }

    /// Every subsequent status change, in order
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowStatus> {
        self.events.subscribe()
    }

    pub fn selected_file(&self) -> Option<String> {
        self.lock().file.as_ref().map(|f| f.name().to_string())
    }

    /// Select the video for the next run. Refused unless waiting.
    pub fn select_file(&self, file: VideoFile) -> bool {
        let mut inner = self.lock();
        if inner.status != WorkflowStatus::Waiting {
            debug!("Ignoring file selection while {}", inner.status);
            return false;
        }
        info!("🎞️ Selected {} ({:.1} MB)", file.name(), file.len() as f64 / 1_000_000.0);
        inner.file = Some(file);
        true
    }

    /// Return to `Waiting` after a finished run. A failed run keeps its file
    /// so it can be retried.
    pub fn reset(&self) -> bool {
        let mut inner = self.lock();
        if !inner.status.is_terminal() {
            return false;
        }
        self.transition(&mut inner, WorkflowStatus::Waiting);
        true
    }

    fn transition(&self, inner: &mut Inner, next: WorkflowStatus) {
        if !inner.status.can_transition_to(&next) {
            // Unreachable through the public API
            error!("Rejected status transition {} -> {}", inner.status, next);
            return;
        }
        debug!("Workflow status: {} -> {}", inner.status, next);
        inner.status = next.clone();
        // No subscribers is fine
        let _ = self.events.send(next);
    }

    fn advance(&self, next: WorkflowStatus) {
        let mut inner = self.lock();
        self.transition(&mut inner, next);
    }

    /// Start a run with the selected file.
    ///
    /// Returns `Ignored` without side effects when no file is selected or a
    /// run is already in progress.
    pub async fn submit(&self, prompt: Option<String>) -> SubmitOutcome {
        let video = {
            let mut inner = self.lock();
            if inner.status != WorkflowStatus::Waiting {
                debug!("Submit ignored while {}", inner.status);
                return SubmitOutcome::Ignored;
            }
            let Some(video) = inner.file.take() else {
                debug!("Submit ignored: no file selected");
                return SubmitOutcome::Ignored;
            };
            self.transition(&mut inner, WorkflowStatus::Converting);
            video
        };

        let prompt = prompt
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        // From here on the run must end in Success or Failed, even if this
        // future is dropped midway
        let mut active = ActiveRun::new(self, video);

        let result = self.run(&active.video, prompt.as_deref()).await;
        match result {
            Ok(asset_id) => {
                active.complete();
                self.advance(WorkflowStatus::Success(asset_id.clone()));
                info!("🎉 Workflow finished: asset {}", asset_id);
                if let Some(callback) = &self.on_complete {
                    callback(&asset_id);
                }
                SubmitOutcome::Completed(asset_id)
            }
            Err(err) => {
                active.fail(err.clone());
                SubmitOutcome::Failed(err)
            }
        }
    }

    /// Give the file back and move to `Failed`
    fn abandon(&self, video: VideoFile, err: WorkflowError) {
        warn!("❌ Workflow failed for {}: {}", video.name(), err);
        let mut inner = self.lock();
        inner.file = Some(video);
        self.transition(&mut inner, WorkflowStatus::Failed(err));
    }

    async fn run(&self, video: &VideoFile, prompt: Option<&str>) -> Result<AssetId, WorkflowError> {
        let audio = self
            .stage("convert", async {
                self.converter.convert(video.bytes()).await.map_err(WorkflowError::from)
            })
            .await?;
        self.advance(WorkflowStatus::Uploading);

        let asset = self
            .stage("upload", self.uploader.upload(audio, &video.audio_filename()))
            .await?;
        self.advance(WorkflowStatus::Generating);

        self.stage("transcription", self.trigger.trigger(&asset.id, prompt))
            .await?;

        Ok(asset.id)
    }

    async fn stage<T, F>(&self, stage: &'static str, fut: F) -> Result<T, WorkflowError>
    where
        F: Future<Output = Result<T, WorkflowError>>,
    {
        match self.stage_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| WorkflowError::Timeout {
                    stage,
                    secs: limit.as_secs(),
                })?,
            None => fut.await,
        }
    }
}

/// An in-flight run. Unless completed or failed explicitly, dropping it
/// fails the run with `Cancelled` and returns the file for a retry.
struct ActiveRun<'a> {
    workflow: &'a Workflow,
    video: VideoFile,
    armed: bool,
}

impl<'a> ActiveRun<'a> {
    fn new(workflow: &'a Workflow, video: VideoFile) -> Self {
        Self {
            workflow,
            video,
            armed: true,
        }
    }

    fn complete(&mut self) {
        self.armed = false;
    }

    fn fail(&mut self, err: WorkflowError) {
        self.armed = false;
        self.workflow.abandon(std::mem::take(&mut self.video), err);
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.workflow
                .abandon(std::mem::take(&mut self.video), WorkflowError::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConversionError;
    use crate::state::Asset;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct FakeConverter {
        calls: AtomicUsize,
        fail_first: bool,
        stall_first: bool,
        gate: Option<Arc<Notify>>,
    }

    impl FakeConverter {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: false,
                stall_first: false,
                gate: None,
            }
        }
    }

    #[async_trait]
    impl AudioConverter for FakeConverter {
        async fn convert(&self, video: &[u8]) -> Result<Vec<u8>, ConversionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.stall_first && call == 0 {
                std::future::pending::<()>().await;
            }
            if self.fail_first && call == 0 {
                return Err(ConversionError::Exec {
                    status: "exit status: 1".to_string(),
                    stderr: "moov atom not found".to_string(),
                });
            }
            let mut audio = vec![0xFF, 0xFB, 0x90, 0x64];
            audio.extend_from_slice(&video[..video.len().min(8)]);
            Ok(audio)
        }
    }

    #[derive(Default)]
    struct FakeServer {
        uploads: Mutex<Vec<String>>,
        triggers: Mutex<Vec<(AssetId, Option<String>)>>,
        reject_trigger: bool,
        stall_upload: bool,
    }

    #[async_trait]
    impl AssetUploader for FakeServer {
        async fn upload(&self, _audio: Vec<u8>, filename: &str) -> Result<Asset, WorkflowError> {
            if self.stall_upload {
                std::future::pending::<()>().await;
            }
            let mut uploads = self.uploads.lock().unwrap();
            uploads.push(filename.to_string());
            Ok(Asset {
                id: AssetId::new(format!("asset-{}", uploads.len())),
                name: filename.to_string(),
                path: PathBuf::from(format!("/tmp/{}", filename)),
                created_at: chrono::Utc::now(),
            })
        }
    }

    #[async_trait]
    impl TranscriptionTrigger for FakeServer {
        async fn trigger(&self, asset_id: &AssetId, prompt: Option<&str>) -> Result<(), WorkflowError> {
            if self.reject_trigger {
                return Err(WorkflowError::JobTrigger {
                    status: 404,
                    message: "Video not found".to_string(),
                });
            }
            self.triggers
                .lock()
                .unwrap()
                .push((asset_id.clone(), prompt.map(str::to_string)));
            Ok(())
        }
    }

    fn workflow(converter: Arc<FakeConverter>, server: Arc<FakeServer>) -> Workflow {
        Workflow::new(converter, server.clone(), server)
    }

    fn drain(rx: &mut broadcast::Receiver<WorkflowStatus>) -> Vec<WorkflowStatus> {
        let mut seen = Vec::new();
        while let Ok(status) = rx.try_recv() {
            seen.push(status);
        }
        seen
    }

    #[test]
    fn test_transition_table_is_forward_only() {
        use WorkflowStatus::*;
        let id = AssetId::new("a");
        let err = WorkflowError::Transport("down".to_string());

        assert!(Waiting.can_transition_to(&Converting));
        assert!(Generating.can_transition_to(&Success(id.clone())));
        assert!(Uploading.can_transition_to(&Failed(err.clone())));
        assert!(Failed(err.clone()).can_transition_to(&Waiting));

        assert!(!Waiting.can_transition_to(&Uploading));
        assert!(!Uploading.can_transition_to(&Converting));
        assert!(!Converting.can_transition_to(&Waiting));
        assert!(!Waiting.can_transition_to(&Failed(err)));
        assert!(!Success(id).can_transition_to(&Converting));
    }

    #[test]
    fn test_audio_filename_follows_video_stem() {
        assert_eq!(VideoFile::new("lecture.mp4", vec![]).audio_filename(), "lecture.mp3");
        assert_eq!(VideoFile::new("", vec![]).audio_filename(), "audio.mp3");
    }

    #[tokio::test]
    async fn test_submit_without_file_is_ignored() {
        let server = Arc::new(FakeServer::default());
        let wf = workflow(Arc::new(FakeConverter::ok()), server.clone());
        let mut rx = wf.subscribe();

        assert_eq!(wf.submit(Some("hint".to_string())).await, SubmitOutcome::Ignored);
        assert_eq!(wf.status(), WorkflowStatus::Waiting);
        assert!(drain(&mut rx).is_empty());
        assert!(server.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_successful_run_emits_every_stage_in_order() {
        let server = Arc::new(FakeServer::default());
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();
        let wf = workflow(Arc::new(FakeConverter::ok()), server.clone())
            .on_complete(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let mut rx = wf.subscribe();

        assert!(wf.select_file(VideoFile::new("talk.mp4", b"video bytes".to_vec())));
        let outcome = wf.submit(Some("  hello,world ".to_string())).await;

        let id = AssetId::new("asset-1");
        assert_eq!(outcome, SubmitOutcome::Completed(id.clone()));
        assert_eq!(
            drain(&mut rx),
            vec![
                WorkflowStatus::Converting,
                WorkflowStatus::Uploading,
                WorkflowStatus::Generating,
                WorkflowStatus::Success(id.clone()),
            ]
        );
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(*server.uploads.lock().unwrap(), vec!["talk.mp3".to_string()]);
        assert_eq!(
            *server.triggers.lock().unwrap(),
            vec![(id, Some("hello,world".to_string()))]
        );
        assert_eq!(wf.selected_file(), None);
    }

    #[tokio::test]
    async fn test_resubmit_while_running_has_no_effect() {
        let gate = Arc::new(Notify::new());
        let converter = Arc::new(FakeConverter {
            calls: AtomicUsize::new(0),
            fail_first: false,
            stall_first: false,
            gate: Some(gate.clone()),
        });
        let server = Arc::new(FakeServer::default());
        let wf = Arc::new(workflow(converter.clone(), server.clone()));

        wf.select_file(VideoFile::new("a.mp4", b"video".to_vec()));
        let running = {
            let wf = wf.clone();
            tokio::spawn(async move { wf.submit(None).await })
        };

        while converter.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(wf.status(), WorkflowStatus::Converting);

        assert_eq!(wf.submit(None).await, SubmitOutcome::Ignored);
        assert_eq!(wf.submit(Some("again".to_string())).await, SubmitOutcome::Ignored);
        assert!(!wf.select_file(VideoFile::new("b.mp4", b"other".to_vec())));

        gate.notify_one();
        let outcome = running.await.unwrap();

        assert!(matches!(outcome, SubmitOutcome::Completed(_)));
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_retry_is_possible() {
        let converter = Arc::new(FakeConverter {
            calls: AtomicUsize::new(0),
            fail_first: true,
            stall_first: false,
            gate: None,
        });
        let server = Arc::new(FakeServer::default());
        let wf = workflow(converter, server.clone());
        let mut rx = wf.subscribe();

        wf.select_file(VideoFile::new("broken.mp4", b"???".to_vec()));
        let outcome = wf.submit(None).await;

        let SubmitOutcome::Failed(err) = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert!(matches!(err, WorkflowError::Conversion(_)));
        assert_eq!(
            drain(&mut rx),
            vec![WorkflowStatus::Converting, WorkflowStatus::Failed(err.clone())]
        );

        // Stuck until reset; the file survives for the retry
        assert_eq!(wf.submit(None).await, SubmitOutcome::Ignored);
        assert_eq!(wf.selected_file(), Some("broken.mp4".to_string()));
        assert!(wf.reset());
        assert_eq!(wf.status(), WorkflowStatus::Waiting);

        assert!(matches!(wf.submit(None).await, SubmitOutcome::Completed(_)));
        assert_eq!(server.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_trigger_fails_run() {
        let server = Arc::new(FakeServer {
            reject_trigger: true,
            ..Default::default()
        });
        let wf = workflow(Arc::new(FakeConverter::ok()), server);

        wf.select_file(VideoFile::new("a.mp4", b"video".to_vec()));
        let outcome = wf.submit(None).await;

        assert!(matches!(
            outcome,
            SubmitOutcome::Failed(WorkflowError::JobTrigger { status: 404, .. })
        ));
        assert_eq!(wf.status().label(), "failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stage_times_out() {
        let server = Arc::new(FakeServer {
            stall_upload: true,
            ..Default::default()
        });
        let wf = workflow(Arc::new(FakeConverter::ok()), server)
            .with_stage_timeout(Some(Duration::from_secs(30)));

        wf.select_file(VideoFile::new("a.mp4", b"video".to_vec()));
        let outcome = wf.submit(None).await;

        assert_eq!(
            outcome,
            SubmitOutcome::Failed(WorkflowError::Timeout {
                stage: "upload",
                secs: 30
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_run_can_be_reset_and_retried() {
        let converter = Arc::new(FakeConverter {
            calls: AtomicUsize::new(0),
            fail_first: false,
            stall_first: true,
            gate: None,
        });
        let server = Arc::new(FakeServer::default());
        let wf = workflow(converter, server.clone());

        wf.select_file(VideoFile::new("stuck.mp4", b"video".to_vec()));
        let waited = tokio::time::timeout(Duration::from_millis(50), wf.submit(None)).await;
        assert!(waited.is_err());

        assert_eq!(wf.status(), WorkflowStatus::Failed(WorkflowError::Cancelled));
        assert_eq!(wf.selected_file(), Some("stuck.mp4".to_string()));
        assert!(wf.reset());

        assert!(matches!(wf.submit(None).await, SubmitOutcome::Completed(_)));
        assert_eq!(*server.uploads.lock().unwrap(), vec!["stuck.mp3".to_string()]);
    }

    #[test]
    fn test_reset_requires_finished_run() {
        let wf = workflow(Arc::new(FakeConverter::ok()), Arc::new(FakeServer::default()));
        assert!(!wf.reset());
        assert_eq!(wf.status(), WorkflowStatus::Waiting);
    }
}
