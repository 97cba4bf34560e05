use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Opaque identifier of an uploaded asset
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One stored audio file and its metadata record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,

    /// Filename as sent by the client
    pub name: String,

    /// Server-controlled storage location
    pub path: PathBuf,

    pub created_at: DateTime<Utc>,
}

impl Asset {
    fn new(name: &str, path: &Path) -> Self {
        let created_at = Utc::now();
        let seed = format!(
            "{}:{}",
            path.display(),
            created_at.timestamp_nanos_opt().unwrap_or_default()
        );

        Self {
            id: AssetId(format!("{:x}", md5::compute(seed.as_bytes()))),
            name: name.to_string(),
            path: path.to_path_buf(),
            created_at,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Asset store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Asset record could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence boundary for asset records.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Record an asset whose bytes are already at `path`
    async fn create_asset(&self, name: &str, path: &Path) -> Result<Asset, StoreError>;

    async fn get_asset(&self, id: &AssetId) -> Result<Option<Asset>, StoreError>;

    async fn list_assets(&self) -> Result<Vec<Asset>, StoreError>;
}

/// Volatile store, used by tests and throwaway servers
#[derive(Debug, Default, Clone)]
pub struct InMemoryAssetStore {
    assets: Arc<RwLock<HashMap<AssetId, Asset>>>,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn create_asset(&self, name: &str, path: &Path) -> Result<Asset, StoreError> {
        let asset = Asset::new(name, path);
        self.assets.write().await.insert(asset.id.clone(), asset.clone());
        Ok(asset)
    }

    async fn get_asset(&self, id: &AssetId) -> Result<Option<Asset>, StoreError> {
        Ok(self.assets.read().await.get(id).cloned())
    }

    async fn list_assets(&self) -> Result<Vec<Asset>, StoreError> {
        let mut assets: Vec<Asset> = self.assets.read().await.values().cloned().collect();
        assets.sort_by_key(|a| a.created_at);
        Ok(assets)
    }
}

/// Asset store persisting one JSON file per record in a state directory
#[derive(Debug, Clone)]
pub struct JsonAssetStore {
    /// Base directory for record files
    state_dir: PathBuf,

    /// In-memory cache of every record on disk
    cache: Arc<RwLock<HashMap<AssetId, Asset>>>,
}

impl JsonAssetStore {
    /// Open the store, loading records left by previous runs
    pub async fn new(state_dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&state_dir).await?;

        let store = Self {
            state_dir,
            cache: Arc::new(RwLock::new(HashMap::new())),
        };

        let loaded = store.load_existing().await?;
        info!("📊 Asset store initialized with {} records", loaded);

        Ok(store)
    }

    async fn load_existing(&self) -> Result<usize, StoreError> {
        let mut entries = fs::read_dir(&self.state_dir).await?;
        let mut cache = self.cache.write().await;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                match Self::load_record(&path).await {
                    Ok(asset) => {
                        cache.insert(asset.id.clone(), asset);
                    }
                    Err(e) => {
                        warn!("Failed to load asset record {}: {}", path.display(), e);
                    }
                }
            }
        }

        Ok(cache.len())
    }

    async fn load_record(path: &Path) -> Result<Asset, StoreError> {
        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    fn record_path(&self, id: &AssetId) -> PathBuf {
        self.state_dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl AssetStore for JsonAssetStore {
    async fn create_asset(&self, name: &str, path: &Path) -> Result<Asset, StoreError> {
        let asset = Asset::new(name, path);

        // Write then rename, so a crash never leaves a truncated record
        let json_content = serde_json::to_string_pretty(&asset)?;
        let record_path = self.record_path(&asset.id);
        let staging_path = record_path.with_extension("json.tmp");
        fs::write(&staging_path, json_content).await?;
        if let Err(e) = fs::rename(&staging_path, &record_path).await {
            let _ = fs::remove_file(&staging_path).await;
            return Err(e.into());
        }
        self.cache.write().await.insert(asset.id.clone(), asset.clone());

        debug!("💾 Recorded asset {} for {}", asset.id, asset.path.display());
        Ok(asset)
    }

    async fn get_asset(&self, id: &AssetId) -> Result<Option<Asset>, StoreError> {
        Ok(self.cache.read().await.get(id).cloned())
    }

    async fn list_assets(&self) -> Result<Vec<Asset>, StoreError> {
        let mut assets: Vec<Asset> = self.cache.read().await.values().cloned().collect();
        assets.sort_by_key(|a| a.created_at);
        Ok(assets)
    }
}
