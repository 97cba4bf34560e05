use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgMatches, Command};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vidscribe::api::{job_queue, AppState, IngestionServer, TranscriptionJob};
use vidscribe::{
    ApiClient, AudioTranscoder, Config, FfmpegEngine, JsonAssetStore, SubmitOutcome,
    UploadStorage, VideoFile, Workflow,
};

fn cli() -> Command {
    Command::new("vidscribe")
        .version(env!("CARGO_PKG_VERSION"))
        .author("TigreRoll")
        .about("Convert videos to audio, upload them and request transcriptions")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (defaults to vidscribe.toml or VIDSCRIBE_* variables)")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the ingestion server")
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .help("Port to listen on")
                        .value_parser(clap::value_parser!(u16)),
                ),
        )
        .subcommand(
            Command::new("submit")
                .about("Convert a video, upload its audio and request a transcription")
                .arg(
                    Arg::new("video")
                        .value_name("VIDEO")
                        .help("Video file to process")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("prompt")
                        .long("prompt")
                        .value_name("TEXT")
                        .help("Hint words for the transcription, e.g. \"hello,world\""),
                )
                .arg(
                    Arg::new("server")
                        .short('s')
                        .long("server")
                        .value_name("URL")
                        .help("Ingestion server base URL"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let default_filter = if matches.get_flag("verbose") {
        "vidscribe=debug,tower_http=debug,info"
    } else {
        "vidscribe=info,tower_http=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = matches.get_one::<PathBuf>("config").map(PathBuf::as_path);
    let mut config = Config::resolve(config_path)?;

    match matches.subcommand() {
        Some(("serve", args)) => {
            if let Some(port) = args.get_one::<u16>("port") {
                config.server.port = *port;
            }
            config.validate()?;
            serve(config).await
        }
        Some(("submit", args)) => {
            if let Some(url) = args.get_one::<String>("server") {
                config.client.base_url = url.clone();
            }
            config.validate()?;
            submit(config, args).await
        }
        _ => Err(anyhow!("Unknown command")),
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("🚀 vidscribe ingestion server starting...");
    for line in config.summary().lines() {
        info!("{}", line);
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;

    let store = JsonAssetStore::new(config.server.state_dir.clone()).await?;
    let storage = UploadStorage::new(&config.server.upload_dir, config.server.max_upload_bytes).await?;
    let (jobs, queue) = job_queue(config.server.job_queue_capacity);
    tokio::spawn(log_jobs(queue));

    let state = AppState::new(
        Arc::new(store),
        Arc::new(storage),
        jobs,
        Arc::new(config.server),
    );

    IngestionServer::new(state, addr).start().await
}

/// Transcription itself runs elsewhere; accepted jobs are only recorded.
async fn log_jobs(mut queue: mpsc::Receiver<TranscriptionJob>) {
    while let Some(job) = queue.recv().await {
        info!(
            asset_id = %job.asset_id,
            prompt = job.prompt.as_deref().unwrap_or(""),
            requested_at = %job.requested_at,
            "📝 Transcription job queued"
        );
    }
}

async fn submit(config: Config, args: &ArgMatches) -> Result<()> {
    let video_path = args
        .get_one::<PathBuf>("video")
        .ok_or_else(|| anyhow!("VIDEO is required"))?;
    let prompt = args.get_one::<String>("prompt").cloned();

    let video = load_video(video_path).await?;

    let transcoder = Arc::new(AudioTranscoder::new(FfmpegEngine::new(
        config.transcoder.ffmpeg_path.clone(),
    )));
    let client = Arc::new(ApiClient::new(&config.client.base_url, config.client.connect_timeout())?);

    let workflow = Workflow::new(transcoder.clone(), client.clone(), client)
        .with_stage_timeout(config.client.stage_timeout())
        .on_complete(|asset_id| info!("🔗 Transcription requested for asset {}", asset_id));

    let mut statuses = workflow.subscribe();
    let progress = tokio::spawn(async move {
        let mut stage = "submit";
        while let Ok(status) = statuses.recv().await {
            println!("{}", status.message());
            if status.is_busy() {
                stage = status.label();
            }
            if status.is_terminal() {
                break;
            }
        }
        stage
    });

    workflow.select_file(video);
    let outcome = workflow.submit(prompt).await;
    drop(workflow);
    let stage = progress.await.unwrap_or("submit");

    match Arc::try_unwrap(transcoder) {
        Ok(transcoder) => {
            if let Err(e) = transcoder.shutdown().await {
                warn!("Failed to release media engine: {}", e);
            }
        }
        Err(_) => warn!("Media engine still in use, skipping teardown"),
    }

    match outcome {
        SubmitOutcome::Completed(asset_id) => {
            println!("{}", asset_id);
            Ok(())
        }
        SubmitOutcome::Failed(err) if err.is_user_correctable() => {
            Err(anyhow!("Upload rejected: {}", err))
        }
        SubmitOutcome::Failed(err) => Err(anyhow!("Workflow failed while {}: {}", stage, err)),
        SubmitOutcome::Ignored => Err(anyhow!("No video selected")),
    }
}

async fn load_video(path: &Path) -> Result<VideoFile> {
    if !path.exists() {
        return Err(anyhow!("Video not found: {}", path.display()));
    }
    let video = VideoFile::from_path(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    info!("📁 Input video: {} ({} bytes)", path.display(), video.len());
    Ok(video)
}
