use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use backhaul::config::Config;
use backhaul::export::HealthMetrics;
use backhaul::manager::{configure_poller, CollectionManager};
use backhaul::plugin::SyntheticPlugin;
use backhaul::sync::SyncBarrier;

/// Polling collection agent that forwards batches to an analytics backend.
#[derive(Parser)]
#[command(name = "backhaul", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Load and validate the configuration, then exit.
    Check,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash, set at build time via env, or "unknown".
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

    if let Some(Command::Version) = &cli.command {
        println!("backhaul {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)?;

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    if let Some(Command::Check) = &cli.command {
        tracing::info!(sources = cfg.sources.len(), "configuration is valid");
        return Ok(());
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting backhaul",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            tracing::error!(error = %e, "signal handling failed, shutting down");
        }
        let _ = shutdown_tx.send(());
    });

    let health = if cfg.health.enabled {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        health
            .start()
            .await
            .context("starting health metrics server")?;
        Some(health)
    } else {
        None
    };

    let barrier = Arc::new(SyncBarrier::with_max_window(cfg.sync.window));
    let mut manager = CollectionManager::new(barrier).with_stagger(cfg.start_stagger);
    if let Some(health) = &health {
        manager = manager.with_health(Arc::clone(health));
    }

    for source in &cfg.sources {
        let plugin = SyntheticPlugin::new(&source.name, source.data_type(), source.category())
            .with_records_per_window(source.synthetic.records_per_window);

        let poller = manager.new_poller(&source.name);
        poller
            .set_plugin(Arc::new(plugin))
            .with_context(|| format!("attaching plugin to {}", source.name))?;
        configure_poller(&poller, source, &cfg.backend, cfg.sync.window)?;
        manager.add_poller(poller);
    }

    if !manager.start().await {
        tracing::warn!("some pollers could not be started");
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                if manager.all_finished() {
                    break;
                }
            }
        }
    }

    let result = manager.stop().await;

    if let Some(health) = &health {
        health.stop().await?;
    }

    tracing::info!("backhaul stopped");

    result
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}
