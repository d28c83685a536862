use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use netmond::clock::SystemClock;
use netmond::config::Config;
use netmond::sampler::NettopSampler;
use netmond::supervisor::Supervisor;

/// Single-host per-process network usage monitor.
#[derive(Parser)]
#[command(name = "netmond", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults to
    /// <data-dir>/config.yaml.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory override (store file, config, logs).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("netmond {}", version::full());
        return Ok(());
    }

    // Resolve config path: explicit flag, else <data-dir>/config.yaml.
    let mut cfg = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => {
            let data_dir = cli.data_dir.clone().unwrap_or_else(|| {
                Config::default().data_dir
            });
            Config::load(&Config::config_path(&data_dir)).context("loading config")?
        }
    };

    if let Some(data_dir) = cli.data_dir {
        cfg.data_dir = data_dir;
    }

    let level = cli.log_level.as_deref().unwrap_or(&cfg.logging.level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(version = version::RELEASE, "starting netmond");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("received interrupt, shutting down");
        }

        let _ = shutdown_tx.send(());
    });

    let sampler_timeout = cfg.daemon.sampler_timeout;
    let mut supervisor = Supervisor::new(cfg, Arc::new(SystemClock)).await?;
    supervisor.start(NettopSampler::new(sampler_timeout)).await?;

    let _ = shutdown_rx.await;

    supervisor.stop().await?;

    Ok(())
}
