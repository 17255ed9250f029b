use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use dashgate::{
    dash::{ManifestResolver, TrackKind},
    decrypt::SegmentDecryptor,
    pipeline::ToolAvailability,
    util::http::HttpClient,
    ClearKeyCredential, Gateway, GatewayConfig, StreamConfig,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// Gateway configuration file
    #[clap(short, long, env = "DASHGATE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise every enabled stream until interrupted
    Serve {
        /// Extra stream definitions in Kodi property format. The file stem is
        /// used as stream id.
        #[clap(long = "kodi")]
        kodi_files: Vec<PathBuf>,

        /// Log a status line per session at this interval, in seconds
        #[clap(long)]
        status_interval: Option<u64>,
    },

    /// Decrypt the best video and audio tracks of a manifest into files
    Decrypt {
        mpd: String,

        /// `<key_id_hex>:<key_hex>`
        #[clap(short = 'k', long)]
        license_key: String,

        #[clap(short, long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Decrypt one track of a manifest to stdout
    Pipe {
        mpd: String,

        #[clap(short = 'k', long)]
        license_key: String,

        /// Write the audio track instead of the video track
        #[clap(long)]
        audio: bool,
    },

    /// Print the resolved manifest as JSON
    Inspect { mpd: String },

    /// Check whether a source URL is reachable
    Check { url: String },

    /// Convert a Kodi property file into a `[[streams]]` entry
    ImportKodi {
        file: PathBuf,

        #[clap(long)]
        id: Option<String>,
    },

    /// Show which external tools were found
    Tools {
        #[clap(long)]
        json: bool,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    match path {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(GatewayConfig::default()),
    }
}

fn http_client(config: &GatewayConfig) -> anyhow::Result<HttpClient> {
    Ok(HttpClient::new(&config.http)?)
}

fn stream_id(path: &Path, id: Option<String>) -> anyhow::Result<String> {
    match id {
        Some(id) => Ok(id),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .context("cannot derive a stream id from the file name"),
    }
}

fn read_kodi_stream(path: &Path, id: Option<String>) -> anyhow::Result<StreamConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(StreamConfig::from_kodi_props(stream_id(path, id)?, &text)?)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = tokio::signal::ctrl_c().await;
}

async fn serve(
    config: GatewayConfig,
    kodi_files: Vec<PathBuf>,
    status_interval: Option<u64>,
) -> anyhow::Result<()> {
    let gateway = Gateway::new(config)?;
    for path in &kodi_files {
        gateway.upsert_stream(read_kodi_stream(path, None)?)?;
    }

    let tools = gateway.tools();
    if tools.transcoder.is_none() {
        tracing::warn!("No transcoder found, every session will fail to start");
    }

    let started = gateway.start_enabled().await;
    tracing::info!("Started {} stream(s): {}", started.len(), started.join(", "));

    let shutdown = CancellationToken::new();
    let sweeper = gateway.spawn_sweeper(shutdown.clone());

    if let Some(secs) = status_interval {
        let gateway = gateway.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        for session in gateway.list_sessions() {
                            tracing::info!(
                                "{}: {:?} via {} (restarts: {}, up {}s)",
                                session.stream_id,
                                session.status,
                                session
                                    .method
                                    .map(|m| m.to_string())
                                    .unwrap_or_else(|| "-".to_string()),
                                session.restart_count,
                                session.uptime.as_secs()
                            );
                        }
                    }
                }
            }
        });
    }

    shutdown_signal().await;
    tracing::info!("Shutting down");
    shutdown.cancel();
    gateway.stop_all().await;
    sweeper.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .try_from_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve {
            kodi_files,
            status_interval,
        } => serve(config, kodi_files, status_interval).await?,
        Command::Decrypt {
            mpd,
            license_key,
            output_dir,
        } => {
            let credential: ClearKeyCredential = license_key.parse()?;
            let client = http_client(&config)?;
            let model = ManifestResolver::new(client.clone()).resolve(&mpd).await?;
            let tracks = SegmentDecryptor::new(client, credential)
                .with_concurrency(config.http.segment_concurrency)
                .decrypt_manifest(&model, &output_dir)
                .await?;
            for file in tracks.files() {
                println!("{}", file.display());
            }
        }
        Command::Pipe {
            mpd,
            license_key,
            audio,
        } => {
            let credential: ClearKeyCredential = license_key.parse()?;
            let client = http_client(&config)?;
            let model = ManifestResolver::new(client.clone()).resolve(&mpd).await?;
            let kind = if audio {
                TrackKind::Audio
            } else {
                TrackKind::Video
            };
            let track = model
                .best_track(kind)
                .with_context(|| format!("manifest has no {kind:?} track"))?;
            let mut stdout = tokio::io::stdout();
            SegmentDecryptor::new(client, credential)
                .with_concurrency(config.http.segment_concurrency)
                .decrypt_to_writer(&track.segments, &mut stdout)
                .await?;
        }
        Command::Inspect { mpd } => {
            let model = ManifestResolver::new(http_client(&config)?)
                .resolve(&mpd)
                .await?;
            println!("{}", serde_json::to_string_pretty(&model)?);
        }
        Command::Check { url } => {
            let gateway = Gateway::with_tools(config, ToolAvailability::default())?;
            let report = gateway.check_connectivity(&url).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.reachable {
                std::process::exit(1);
            }
        }
        Command::ImportKodi { file, id } => {
            let stream = read_kodi_stream(&file, id)?;
            println!("[[streams]]\n{}", toml::to_string(&stream)?);
        }
        Command::Tools { json } => {
            let tools = ToolAvailability::detect(&config);
            if json {
                println!("{}", serde_json::to_string_pretty(&tools)?);
            } else {
                let show = |path: &Option<PathBuf>| {
                    path.as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "not found".to_string())
                };
                println!("transcoder: {}", show(&tools.transcoder));
                println!("downloader: {}", show(&tools.downloader));
            }
        }
    }

    Ok(())
}
