use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camrtsp::config::{CameraConfig, RtspConfig};
use camrtsp::registry::StreamRegistry;
use camrtsp::rtsp::RtspServer;
use camrtsp::session_manager::{self, SessionManager};
use camrtsp::Integration;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Standalone camrtsp server command line arguments
#[derive(Parser, Debug)]
#[command(name = "camrtsp")]
#[command(version, about = "Native RTSP/RTP streaming server for camera surveillance", long_about = None)]
struct CliArgs {
    /// Path to the JSON config file (see DESIGN.md for the expected shape)
    #[arg(short = 'c', long, value_name = "FILE", default_value = "/etc/camrtsp/config.json")]
    config: PathBuf,

    /// Listen port (overrides the config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    bind: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// On-disk shape of the config file the embedding app would normally
/// construct and pass in directly; the standalone binary reads it itself
/// since this crate never owns persistence.
#[derive(Debug, serde::Deserialize)]
struct FileConfig {
    #[serde(flatten)]
    rtsp: RtspConfig,
    cameras: Vec<CameraConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting camrtsp v{}", env!("CARGO_PKG_VERSION"));

    let file_config = load_config(&args.config).await?;
    let mut rtsp_config = file_config.rtsp;
    if let Some(port) = args.port {
        rtsp_config.port = port;
    }
    if let Some(bind) = args.bind {
        rtsp_config.bind = bind;
    }

    if !rtsp_config.enabled {
        tracing::info!("RTSP server disabled in config, exiting");
        return Ok(());
    }

    tracing::info!(
        bind = %rtsp_config.bind,
        port = rtsp_config.port,
        auth = rtsp_config.auth_enabled(),
        cameras = file_config.cameras.len(),
        "configuration loaded",
    );

    let streams = StreamRegistry::new();
    let sessions = SessionManager::new();

    let mut integration = Integration::new(streams.clone());
    integration.start(
        file_config.cameras,
        rtsp_config.video_bitrate,
        &rtsp_config.video_preset,
        rtsp_config.audio_enabled,
    );

    let server = RtspServer::new(rtsp_config, streams.clone(), sessions.clone());

    let idle_sweep = session_manager::spawn_idle_sweep(sessions.clone(), streams.clone());
    let rtcp_task = session_manager::spawn_rtcp_task(sessions.clone());

    let server_for_run = server.clone();
    let run_handle = tokio::spawn(async move { server_for_run.run().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, draining connections");

    server.shutdown();
    idle_sweep.abort();
    rtcp_task.abort();

    match run_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("RTSP server exited with error: {}", e),
        Err(e) if !e.is_cancelled() => tracing::warn!("RTSP server task ended abnormally: {}", e),
        Err(_) => {}
    }

    integration.stop().await;

    tracing::info!("camrtsp shutdown complete");
    Ok(())
}

async fn load_config(path: &PathBuf) -> anyhow::Result<FileConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let config: FileConfig = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {}", path.display(), e))?;
    Ok(config)
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camrtsp=error",
        LogLevel::Warn => "camrtsp=warn",
        LogLevel::Info => "camrtsp=info",
        LogLevel::Verbose => "camrtsp=debug",
        LogLevel::Debug => "camrtsp=debug",
        LogLevel::Trace => "camrtsp=trace",
    };

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
