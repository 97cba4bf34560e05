//! Server-side upload storage: collision resistant naming and streamed writes.

use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const MAX_BASE_NAME_LENGTH: usize = 128;
const MAX_CREATE_ATTEMPTS: u32 = 16;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload stream failed: {0}")]
    Stream(String),

    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("Could not allocate a unique storage name for {0}")]
    NameExhausted(String),
}

/// A file fully written to the upload directory
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub path: PathBuf,
    pub bytes_written: u64,
}

/// Upload directory owned by the ingestion service
#[derive(Debug)]
pub struct UploadStorage {
    dir: PathBuf,
    max_file_bytes: u64,
    sequence: AtomicU64,
}

impl UploadStorage {
    /// Create the directory if needed. Stored paths are absolute.
    pub async fn new(dir: impl AsRef<Path>, max_file_bytes: u64) -> Result<Self, StorageError> {
        fs::create_dir_all(dir.as_ref()).await?;
        let dir = fs::canonicalize(dir.as_ref()).await?;

        Ok(Self {
            dir,
            max_file_bytes,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// `{base}-{millis}-{sequence}{ext}`, e.g. `lecture-1718031234567-0.mp3`
    pub fn storage_name(original_filename: &str, millis: i64, sequence: u64) -> String {
        let (base, extension) = split_filename(original_filename);
        format!("{}-{}-{}{}", base, millis, sequence, extension)
    }

    /// Create a brand-new file for `original_filename`, never reusing an existing path
    async fn create_file(&self, original_filename: &str) -> Result<(PathBuf, File), StorageError> {
        let millis = chrono::Utc::now().timestamp_millis();

        for _ in 0..MAX_CREATE_ATTEMPTS {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            let path = self.dir.join(Self::storage_name(original_filename, millis, sequence));

            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!("Storage name taken, retrying: {}", path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StorageError::NameExhausted(original_filename.to_string()))
    }

    /// Stream chunks into a new file. The file is flushed and synced before
    /// this returns; on any failure the partial file is removed.
    pub async fn write_stream<S, B>(
        &self,
        original_filename: &str,
        stream: S,
    ) -> Result<StoredUpload, StorageError>
    where
        S: Stream<Item = Result<B, StorageError>>,
        B: AsRef<[u8]>,
    {
        let (path, file) = self.create_file(original_filename).await?;
        // Also covers the caller dropping this future mid-stream
        let mut partial = PartialUpload::new(path.clone());
        let mut file = file;

        let written = self.copy_stream(&mut file, stream).await;
        let written = match written {
            Ok(bytes) => bytes,
            Err(e) => {
                drop(file);
                drop(partial);
                return Err(e);
            }
        };
        partial.commit();

        debug!(path = %path.display(), bytes = written, "Upload stored");
        Ok(StoredUpload {
            path,
            bytes_written: written,
        })
    }

    async fn copy_stream<S, B>(&self, file: &mut File, stream: S) -> Result<u64, StorageError>
    where
        S: Stream<Item = Result<B, StorageError>>,
        B: AsRef<[u8]>,
    {
        futures::pin_mut!(stream);
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let bytes = chunk.as_ref();
            written += bytes.len() as u64;
            if written > self.max_file_bytes {
                return Err(StorageError::TooLarge {
                    limit: self.max_file_bytes,
                });
            }
            file.write_all(bytes).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Best-effort removal of a stored file
    pub async fn discard(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove partial upload {}: {}", path.display(), e);
            }
        }
    }
}

/// Removes a half-written upload on drop unless committed
struct PartialUpload {
    path: PathBuf,
    committed: bool,
}

impl PartialUpload {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for PartialUpload {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Partial upload removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial upload {}: {}", self.path.display(), e),
        }
    }
}

/// Split into a sanitized base name and the original extension (with dot).
fn split_filename(original_filename: &str) -> (String, String) {
    // Only the final path component ever reaches the storage directory
    let name = original_filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(original_filename);

    let path = Path::new(name);
    let extension = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let base: String = stem
        .chars()
        .take(MAX_BASE_NAME_LENGTH)
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    let base = if base.trim_matches('_').is_empty() {
        "upload".to_string()
    } else {
        base
    };

    let extension = extension
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '.')
        .collect();

    (base, extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;

    #[test]
    fn test_storage_name_keeps_base_and_extension() {
        assert_eq!(
            UploadStorage::storage_name("audio.mp3", 1718031234567, 0),
            "audio-1718031234567-0.mp3"
        );
        assert_eq!(
            UploadStorage::storage_name("my talk.final.mp3", 5, 2),
            "my_talk_final-5-2.mp3"
        );
    }

    #[test]
    fn test_storage_name_strips_directories() {
        assert_eq!(UploadStorage::storage_name("../../etc/passwd.mp3", 1, 0), "passwd-1-0.mp3");
        assert_eq!(UploadStorage::storage_name("C:\\music\\song.mp3", 1, 0), "song-1-0.mp3");
        assert_eq!(UploadStorage::storage_name("...mp3", 1, 0), "upload-1-0.mp3");
    }

    #[tokio::test]
    async fn test_same_name_gets_unique_paths() {
        let temp_dir = TempDir::new().unwrap();
        let storage = UploadStorage::new(temp_dir.path(), 1024).await.unwrap();

        let chunks = || stream::iter(vec![Ok::<_, StorageError>(b"abc".to_vec())]);
        let first = storage.write_stream("audio.mp3", chunks()).await.unwrap();
        let second = storage.write_stream("audio.mp3", chunks()).await.unwrap();

        assert_ne!(first.path, second.path);
        assert!(first.path.starts_with(storage.dir()));
        assert_eq!(first.bytes_written, 3);
        assert_eq!(tokio::fs::read(&second.path).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_failed_stream_removes_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let storage = UploadStorage::new(temp_dir.path(), 1024).await.unwrap();

        let chunks = stream::iter(vec![
            Ok(b"partial".to_vec()),
            Err(StorageError::Stream("connection reset".to_string())),
        ]);
        let err = storage.write_stream("audio.mp3", chunks).await.unwrap_err();
        assert!(matches!(err, StorageError::Stream(_)));

        let mut entries = tokio::fs::read_dir(storage.dir()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_stream_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let storage = UploadStorage::new(temp_dir.path(), 4).await.unwrap();

        let chunks = stream::iter(vec![Ok::<_, StorageError>(vec![0u8; 3]), Ok(vec![0u8; 3])]);
        let err = storage.write_stream("big.mp3", chunks).await.unwrap_err();
        assert!(matches!(err, StorageError::TooLarge { limit: 4 }));

        let mut entries = tokio::fs::read_dir(storage.dir()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abandoned_stream_removes_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let storage = UploadStorage::new(temp_dir.path(), 1024).await.unwrap();

        // One chunk, then a client that never sends the rest
        let chunks = stream::iter(vec![Ok::<_, StorageError>(b"partial".to_vec())])
            .chain(stream::pending());
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            storage.write_stream("audio.mp3", chunks),
        )
        .await;
        assert!(waited.is_err());

        let mut entries = tokio::fs::read_dir(storage.dir()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
