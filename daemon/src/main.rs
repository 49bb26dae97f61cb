//! VCS Server daemon
//!
//! Headless entry point: parse flags, set up logging, bring the
//! application up in the configured distribution mode and run until
//! interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use vcs_daemon::app::{DistributionMode, VcsApplication};

/// VCS Server - voice communication server daemon
#[derive(Parser, Debug)]
#[command(name = "vcsd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the banned clients file
    #[arg(long, default_value = "banned_clients.json")]
    banned: PathBuf,

    /// Folder to store log files
    #[arg(long, default_value = "log")]
    log_folder: PathBuf,

    /// Automatically start servers on application startup
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    autostart: bool,

    /// Enable file logging
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    file_log: bool,

    /// Distribution mode (standalone, control, voice)
    #[arg(long, default_value = "standalone")]
    mode: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_folder, args.file_log)?;

    let mode: DistributionMode = args.mode.parse().map_err(anyhow::Error::msg)?;

    info!(version = env!("CARGO_PKG_VERSION"), "vcs server starting");
    info!(config = %args.config.display(), banned = %args.banned.display(), %mode, "using configuration");

    let app = Arc::new(VcsApplication::new(&args.config, &args.banned, mode)?);

    if args.autostart {
        app.start_servers().await?;
    } else {
        info!("autostart disabled, servers stay down until started via the admin seam");
    }

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    app.shutdown().await;

    Ok(())
}

/// Text logging to stdout, plus a JSON log file when enabled. The level
/// comes from `RUST_LOG`, defaulting to info.
fn init_logging(log_folder: &Path, file_log: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer();

    if file_log {
        std::fs::create_dir_all(log_folder)
            .with_context(|| format!("error creating log directory {}", log_folder.display()))?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_folder.join("vcs-server.log.jsonl"))
            .context("error opening log file")?;

        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(Arc::new(file));

        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(stdout_layer).init();
    }

    Ok(())
}
