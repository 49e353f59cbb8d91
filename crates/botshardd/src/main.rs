//! botshardd — the botshard daemon.
//!
//! Single binary that assembles all botshard subsystems:
//! - State store (redb)
//! - Simulation engine client (in-process or HTTP)
//! - Pool provisioner and channel assigner
//! - Auto-scaler
//! - Pool health monitor
//! - Command injection pipeline
//! - Registration tracker
//! - Metrics collector
//! - REST API
//!
//! # Usage
//!
//! ```text
//! botshardd serve --port 8080 --data-dir /var/lib/botshard --config botshard.toml
//! botshardd config --config botshard.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use botshard_core::{BotshardConfig, SystemClock};
use botshardd::{build_engine, build_probe, Services};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "botshardd", about = "botshard channel control plane daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server and every control loop.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/botshard")]
        data_dir: PathBuf,

        /// Path to botshard.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Engine mode override: `memory` or `http`.
        #[arg(long)]
        engine: Option<String>,

        /// Engine endpoint override for `http` mode.
        #[arg(long)]
        engine_endpoint: Option<String>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,botshardd=debug,botshard=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<BotshardConfig> {
    match path {
        Some(path) => BotshardConfig::from_file(path),
        None => Ok(BotshardConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve {
            port,
            data_dir,
            config,
            engine,
            engine_endpoint,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(mode) = engine {
                config.engine.mode = mode;
            }
            if let Some(endpoint) = engine_endpoint {
                config.engine.endpoint = endpoint;
            }
            config.validate()?;
            run_serve(port, data_dir, config).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_serve(port: u16, data_dir: PathBuf, config: BotshardConfig) -> anyhow::Result<()> {
    info!(
        regions = ?config.fleet.regions,
        engine = %config.engine.mode,
        "botshard daemon starting"
    );

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("botshard.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = botshard_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let clock = SystemClock::shared();
    let engine = build_engine(&config.engine, clock.clone())?;
    let probe = build_probe(&config);
    let services = Services::build(config, state, engine, probe, clock);
    services.bootstrap().await?;

    // ── Start background tasks ─────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = services.spawn_loops(shutdown_rx);

    // ── Start API server ───────────────────────────────────────

    let router = services.router();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    for handle in handles {
        let _ = handle.await;
    }

    info!("botshard daemon stopped");
    Ok(())
}
