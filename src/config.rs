use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default cap on a single uploaded audio file (25 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// Configuration for vidscribe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ingestion server settings
    pub server: ServerConfig,

    /// Workflow client settings
    pub client: ClientConfig,

    /// Media engine settings
    pub transcoder: TranscoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,

    pub port: u16,

    /// Directory uploaded audio is written to
    pub upload_dir: PathBuf,

    /// Directory holding asset records
    pub state_dir: PathBuf,

    /// Maximum size of one uploaded file in bytes
    pub max_upload_bytes: u64,

    /// Accepted extensions, including the dot
    pub allowed_extensions: Vec<String>,

    /// Pending transcription jobs held before requests are refused
    pub job_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the ingestion server
    pub base_url: String,

    /// Connection timeout for API calls (seconds)
    pub connect_timeout_secs: u64,

    /// Per-stage timeout (seconds). Unset means stages may run forever.
    pub stage_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    /// ffmpeg binary, looked up on PATH when relative
    pub ffmpeg_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3333,
            upload_dir: PathBuf::from("./tmp"),
            state_dir: PathBuf::from("./data/assets"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_extensions: vec![".mp3".to_string()],
            job_queue_capacity: 64,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3333".to_string(),
            connect_timeout_secs: 10,
            stage_timeout_secs: None,
        }
    }
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from an explicit file, the default locations, or
    /// the environment, in that order
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let config_paths = ["vidscribe.toml", "config/vidscribe.toml"];

        for path in &config_paths {
            let path = Path::new(path);
            if path.exists() {
                match Self::from_file(path) {
                    Ok(config) => return Ok(config),
                    Err(e) => tracing::warn!("Failed to parse config file {}: {:#}", path.display(), e),
                }
            }
        }

        Self::from_env()
    }

    /// Like `load`, but a broken default file or environment falls back to
    /// defaults. An explicitly named file must load.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::load(None).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config, using defaults: {:#}", e);
                Self::default()
            })),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        tracing::info!("📄 Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Defaults overridden by `VIDSCRIBE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("VIDSCRIBE_HOST") {
            config.server.host = host;
        }

        if let Ok(port) = std::env::var("VIDSCRIBE_PORT") {
            config.server.port = port.parse().context("VIDSCRIBE_PORT must be a port number")?;
        }

        if let Ok(dir) = std::env::var("VIDSCRIBE_UPLOAD_DIR") {
            config.server.upload_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("VIDSCRIBE_STATE_DIR") {
            config.server.state_dir = PathBuf::from(dir);
        }

        if let Ok(max) = std::env::var("VIDSCRIBE_MAX_UPLOAD_BYTES") {
            config.server.max_upload_bytes = max
                .parse()
                .context("VIDSCRIBE_MAX_UPLOAD_BYTES must be a byte count")?;
        }

        if let Ok(url) = std::env::var("VIDSCRIBE_SERVER_URL") {
            config.client.base_url = url;
        }

        if let Ok(secs) = std::env::var("VIDSCRIBE_STAGE_TIMEOUT") {
            config.client.stage_timeout_secs =
                Some(secs.parse().context("VIDSCRIBE_STAGE_TIMEOUT must be seconds")?);
        }

        if let Ok(path) = std::env::var("VIDSCRIBE_FFMPEG") {
            config.transcoder.ffmpeg_path = PathBuf::from(path);
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.max_upload_bytes == 0 {
            return Err(anyhow!("max_upload_bytes must be greater than 0"));
        }

        if self.server.allowed_extensions.is_empty() {
            return Err(anyhow!("allowed_extensions must not be empty"));
        }

        if let Some(ext) = self.server.allowed_extensions.iter().find(|e| !e.starts_with('.')) {
            return Err(anyhow!("allowed extension '{}' must start with a dot", ext));
        }

        if self.server.job_queue_capacity == 0 {
            return Err(anyhow!("job_queue_capacity must be greater than 0"));
        }

        url::Url::parse(&self.client.base_url)
            .with_context(|| format!("Invalid client base_url '{}'", self.client.base_url))?;

        if self.client.stage_timeout_secs == Some(0) {
            return Err(anyhow!("stage_timeout_secs must be greater than 0 when set"));
        }

        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "vidscribe configuration:\n\
            - Listen: {}:{}\n\
            - Upload dir: {}\n\
            - State dir: {}\n\
            - Max upload: {:.1} MiB\n\
            - Allowed extensions: {}\n\
            - Server URL: {}\n\
            - Stage timeout: {}",
            self.server.host,
            self.server.port,
            self.server.upload_dir.display(),
            self.server.state_dir.display(),
            self.server.max_upload_bytes as f64 / (1024.0 * 1024.0),
            self.server.allowed_extensions.join(", "),
            self.client.base_url,
            self.client
                .stage_timeout_secs
                .map(|s| format!("{}s", s))
                .unwrap_or_else(|| "none".to_string()),
        )
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn with_upload_dir(mut self, dir: PathBuf) -> Self {
        self.config.server.upload_dir = dir;
        self
    }

    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.config.server.state_dir = dir;
        self
    }

    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.config.server.max_upload_bytes = bytes;
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.client.base_url = url.into();
        self
    }

    pub fn with_stage_timeout(mut self, secs: Option<u64>) -> Self {
        self.config.client.stage_timeout_secs = secs;
        self
    }

    pub fn with_ffmpeg_path(mut self, path: PathBuf) -> Self {
        self.config.transcoder.ffmpeg_path = path;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
