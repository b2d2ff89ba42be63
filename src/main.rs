use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use hindsight::agent::Agent;
use hindsight::collector::Collector;
use hindsight::config::Config;
use hindsight::coordinator::CoordinatorService;

/// Retroactive distributed tracing: agent, coordinator and collector.
#[derive(Parser)]
#[command(name = "hindsight", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Run the per-host agent.
    Agent,
    /// Run the trigger dissemination coordinator.
    Coordinator,
    /// Run the trace data collector.
    Collector,
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

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

    if let Command::Version = cli.command {
        println!("hindsight {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };

    // The flag overrides the file.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    match cli.command {
        Command::Agent => cfg.validate_agent()?,
        Command::Coordinator => cfg.validate_coordinator()?,
        Command::Collector => cfg.validate_collector()?,
        Command::Version => {}
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting hindsight",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async move {
        match cli.command {
            Command::Agent => run_agent(cfg).await,
            Command::Coordinator => run_coordinator(cfg).await,
            Command::Collector => run_collector(cfg).await,
            Command::Version => Ok(()),
        }
    })
}

/// Resolves on SIGINT, SIGTERM or cancellation of `stopped`.
async fn wait_for_shutdown(stopped: CancellationToken) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = stopped.cancelled() => {
            tracing::warn!("component stopped, shutting down");
        }
    }

    Ok(())
}

async fn run_agent(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    // Holding the producer keeps the pool's batch channels open.
    let _producer = agent.take_producer();
    agent.start().await?;

    wait_for_shutdown(agent.cancelled()).await?;

    agent.stop().await?;
    tracing::info!("agent stopped");

    Ok(())
}

async fn run_coordinator(cfg: Config) -> Result<()> {
    let mut coordinator = CoordinatorService::new(cfg)?;
    coordinator.start().await?;

    wait_for_shutdown(CancellationToken::new()).await?;

    coordinator.stop().await?;
    tracing::info!("coordinator stopped");

    Ok(())
}

async fn run_collector(cfg: Config) -> Result<()> {
    let mut collector = Collector::new(cfg)?;
    collector.start().await?;

    wait_for_shutdown(CancellationToken::new()).await?;

    collector.stop().await?;
    tracing::info!("collector stopped");

    Ok(())
}
