use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use event_rollup::{agent, config};

/// Incremental per-day rollups of game-client telemetry.
#[derive(Parser)]
#[command(name = "event-rollup", about)]
struct Cli {
    /// Path to the YAML configuration file. Without it, configuration comes
    /// from ROLLUP_* environment variables.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging filter (trace, debug, info, warn, error or an EnvFilter
    /// directive). Overrides `log_level` from the configuration.
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

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("event-rollup {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => config::Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => config::Config::from_env().context("loading config from environment")?,
    };

    let level = cfg.log_filter(cli.log_level.as_deref());
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting event-rollup",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: config::Config) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut agent = agent::Agent::new(cfg)?;
    agent.start().await?;

    // Wait for a shutdown signal, or for the service to stop on its own.
    let finished = tokio::select! {
        _ = &mut shutdown_rx => None,
        result = agent.wait() => Some(result),
    };

    agent.stop().await?;

    if let Some(result) = finished {
        result.context("rollup service stopped")?;
    }

    tracing::info!("event-rollup stopped");

    Ok(())
}
