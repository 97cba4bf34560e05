use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ConversionError;

/// Bitrate passed to the encoder for every conversion
pub const AUDIO_BITRATE: &str = "20k";
/// Encoder used for every conversion
pub const AUDIO_CODEC: &str = "libmp3lame";
/// Name the video is written under inside the engine's scratch space
pub const INPUT_FILE: &str = "input.mp4";
/// Name the engine writes its single audio output to
pub const OUTPUT_FILE: &str = "output.mp3";

/// Fixed engine invocation: keep only the audio stream and re-encode it as
/// low bitrate MP3.
pub fn conversion_args() -> Vec<String> {
    [
        "-i", INPUT_FILE,
        "-map", "0:a",
        "-b:a", AUDIO_BITRATE,
        "-acodec", AUDIO_CODEC,
        OUTPUT_FILE,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Primitives required from an in-process media conversion engine.
///
/// Files live in a scratch space owned by the engine instance; names are
/// relative to it.
#[async_trait]
pub trait MediaEngine: Send {
    /// Perform the expensive one-time setup. Called lazily before first use.
    async fn load(&mut self) -> Result<(), ConversionError>;

    fn is_loaded(&self) -> bool;

    async fn write_input(&mut self, name: &str, data: &[u8]) -> Result<(), ConversionError>;

    async fn exec(&mut self, args: &[String]) -> Result<(), ConversionError>;

    async fn read_output(&mut self, name: &str) -> Result<Vec<u8>, ConversionError>;

    /// Delete a scratch file. Missing files are not an error.
    async fn remove(&mut self, name: &str) -> Result<(), ConversionError>;

    /// Release the scratch space. The engine is unusable afterwards.
    async fn teardown(&mut self) -> Result<(), ConversionError>;
}

/// Media engine backed by the `ffmpeg` binary running in a private temp dir
pub struct FfmpegEngine {
    binary: PathBuf,
    workdir: Option<TempDir>,
    torn_down: bool,
}

impl FfmpegEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            workdir: None,
            torn_down: false,
        }
    }

    fn workdir(&self) -> Result<&Path, ConversionError> {
        if self.torn_down {
            return Err(ConversionError::TornDown);
        }
        self.workdir
            .as_ref()
            .map(|dir| dir.path())
            .ok_or_else(|| ConversionError::EngineInit("engine used before load".to_string()))
    }
}

#[async_trait]
impl MediaEngine for FfmpegEngine {
    async fn load(&mut self) -> Result<(), ConversionError> {
        if self.torn_down {
            return Err(ConversionError::TornDown);
        }

        let status = tokio::process::Command::new(&self.binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                ConversionError::EngineInit(format!("{}: {}", self.binary.display(), e))
            })?;

        if !status.success() {
            return Err(ConversionError::EngineInit(format!(
                "{} -version exited with {}",
                self.binary.display(),
                status
            )));
        }

        let workdir = tempfile::Builder::new()
            .prefix("vidscribe-ffmpeg-")
            .tempdir()
            .map_err(|e| ConversionError::EngineInit(e.to_string()))?;

        info!("🎬 Media engine ready: {} (scratch {})", self.binary.display(), workdir.path().display());
        self.workdir = Some(workdir);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.workdir.is_some()
    }

    async fn write_input(&mut self, name: &str, data: &[u8]) -> Result<(), ConversionError> {
        let path = self.workdir()?.join(name);
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn exec(&mut self, args: &[String]) -> Result<(), ConversionError> {
        let workdir = self.workdir()?.to_path_buf();

        let output = tokio::process::Command::new(&self.binary)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(args)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ConversionError::Exec {
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(())
    }

    async fn read_output(&mut self, name: &str) -> Result<Vec<u8>, ConversionError> {
        let path = self.workdir()?.join(name);
        Ok(tokio::fs::read(&path).await?)
    }

    async fn remove(&mut self, name: &str) -> Result<(), ConversionError> {
        let path = self.workdir()?.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn teardown(&mut self) -> Result<(), ConversionError> {
        self.torn_down = true;
        if let Some(workdir) = self.workdir.take() {
            workdir.close()?;
            debug!("Media engine scratch space released");
        }
        Ok(())
    }
}

/// Converts video bytes into audio bytes.
#[async_trait]
pub trait AudioConverter: Send + Sync {
    async fn convert(&self, video: &[u8]) -> Result<Vec<u8>, ConversionError>;
}

/// Transcoder adapter around an injected media engine.
///
/// The engine is loaded on first use and reused afterwards. Access is
/// serialized, so one adapter can be shared between workflows.
pub struct AudioTranscoder<E: MediaEngine> {
    engine: Mutex<E>,
}

impl<E: MediaEngine> AudioTranscoder<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Mutex::new(engine),
        }
    }

    /// Tear the engine down and consume the adapter
    pub async fn shutdown(self) -> Result<(), ConversionError> {
        let mut engine = self.engine.into_inner();
        engine.teardown().await
    }

    async fn run_conversion(engine: &mut E, video: &[u8]) -> Result<Vec<u8>, ConversionError> {
        engine.write_input(INPUT_FILE, video).await?;
        engine.exec(&conversion_args()).await?;
        engine.read_output(OUTPUT_FILE).await
    }
}

#[async_trait]
impl<E: MediaEngine> AudioConverter for AudioTranscoder<E> {
    async fn convert(&self, video: &[u8]) -> Result<Vec<u8>, ConversionError> {
        let mut engine = self.engine.lock().await;

        if !engine.is_loaded() {
            engine.load().await?;
        }

        info!("🎵 Converting {:.1} MB of video to {} {}", video.len() as f64 / 1_000_000.0, AUDIO_CODEC, AUDIO_BITRATE);
        let result = Self::run_conversion(&mut engine, video).await;

        // Scratch files never outlive a call, successful or not.
        for name in [INPUT_FILE, OUTPUT_FILE] {
            if let Err(e) = engine.remove(name).await {
                warn!("Failed to remove scratch file {}: {}", name, e);
            }
        }

        let audio = result?;
        if audio.is_empty() {
            return Err(ConversionError::EmptyOutput);
        }

        match probe_mp3(&audio) {
            Some(header) => {
                info!("✅ Audio ready: {} bytes ({} kbps, {} Hz)", audio.len(), header.bitrate_kbps, header.sample_rate);
                Ok(audio)
            }
            None => Err(ConversionError::InvalidOutput),
        }
    }
}

/// Header of the first MPEG audio frame in a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mp3FrameHeader {
    pub version: MpegVersion,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

const MPEG1_L3_BITRATES: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const MPEG2_L3_BITRATES: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

/// Locate the first Layer III frame, skipping a leading ID3v2 tag.
///
/// Returns `None` when the bytes are not a decodable MP3 stream.
pub fn probe_mp3(data: &[u8]) -> Option<Mp3FrameHeader> {
    let mut offset = 0usize;

    if data.len() >= 10 && &data[..3] == b"ID3" {
        let size_bytes = &data[6..10];
        if size_bytes.iter().any(|b| b & 0x80 != 0) {
            return None;
        }
        let tag_size = size_bytes
            .iter()
            .fold(0usize, |acc, b| (acc << 7) | (*b as usize));
        let footer = if data[5] & 0x10 != 0 { 10 } else { 0 };
        offset = 10 + tag_size + footer;
    }

    parse_frame_header(data.get(offset..offset + 4)?)
}

/// True when `data` looks like a complete MP3 stream
pub fn looks_like_mp3(data: &[u8]) -> bool {
    probe_mp3(data).is_some()
}

fn parse_frame_header(header: &[u8]) -> Option<Mp3FrameHeader> {
    if header[0] != 0xFF || header[1] & 0xE0 != 0xE0 {
        return None;
    }

    let version = match (header[1] >> 3) & 0b11 {
        0b11 => MpegVersion::Mpeg1,
        0b10 => MpegVersion::Mpeg2,
        0b00 => MpegVersion::Mpeg25,
        _ => return None,
    };

    // Layer III only
    if (header[1] >> 1) & 0b11 != 0b01 {
        return None;
    }

    let bitrate_index = (header[2] >> 4) as usize;
    let sample_rate_index = ((header[2] >> 2) & 0b11) as usize;
    if bitrate_index == 0x0F || sample_rate_index == 0b11 {
        return None;
    }

    let (bitrates, sample_rates) = match version {
        MpegVersion::Mpeg1 => (&MPEG1_L3_BITRATES, [44100, 48000, 32000]),
        MpegVersion::Mpeg2 => (&MPEG2_L3_BITRATES, [22050, 24000, 16000]),
        MpegVersion::Mpeg25 => (&MPEG2_L3_BITRATES, [11025, 12000, 8000]),
    };

    Some(Mp3FrameHeader {
        version,
        bitrate_kbps: bitrates[bitrate_index],
        sample_rate: sample_rates[sample_rate_index],
    })
}
