mod bus;
mod docker;
mod orchestrator;
mod pty;
mod reaper;
mod routes;
mod transcript;
mod warm;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::Router;
use axum::routing::{delete, get, post};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use adz_core::{AdzConfig, load_config};

use crate::bus::EventBus;
use crate::docker::DockerDriver;
use crate::orchestrator::Orchestrator;
use crate::warm::WarmPool;

#[derive(Parser, Debug)]
#[command(name = "adzd", version, about = "adz CLI-agent session control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the adzd HTTP service.
    Serve(ServeArgs),
    /// Print the effective config as JSON.
    PrintConfig(PrintConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "config/adz.toml")]
    config: PathBuf,
    /// Override the listen address as host:port.
    #[arg(long)]
    bind: Option<String>,
}

#[derive(clap::Args, Debug)]
struct PrintConfigArgs {
    #[arg(long, default_value = "config/adz.toml")]
    config: PathBuf,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub started_at: Instant,
    pub config: Arc<AdzConfig>,
    pub orchestrator: Orchestrator,
    pub warm: WarmPool,
    pub bus: EventBus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("config/adz.toml"),
        bind: None,
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    if let Some(bind) = args.bind {
        let (host, port) = bind
            .rsplit_once(':')
            .context("--bind must be host:port")?;
        config.server.bind_host = host.to_string();
        config.server.port = port.parse().context("invalid --bind port")?;
    }

    let bind = config.bind_addr();
    let config = Arc::new(config);

    let driver = Arc::new(DockerDriver::new(config.runtime.image.clone()));
    match driver.ensure_available().await {
        Ok(()) => driver.cleanup_orphans().await,
        Err(err) => {
            warn!(err = %err, "container runtime unavailable — run endpoints will fail until it returns");
        }
    }

    let bus = EventBus::new();
    let warm = WarmPool::new(driver.clone());
    let orchestrator = Orchestrator::new(driver.clone(), warm.clone(), bus.clone(), config.clone());

    let state = AppState {
        started_at: Instant::now(),
        config: config.clone(),
        orchestrator: orchestrator.clone(),
        warm,
        bus,
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reaper_handle = tokio::spawn(reaper::run_reaper(
        orchestrator.clone(),
        config.reaper.idle_timeout_sec,
        shutdown_rx,
    ));

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind listener on {bind}"))?;

    info!(bind = %bind, image = %config.runtime.image, "adzd listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly")?;

    info!("shutting down: closing live runs");
    orchestrator.close_all().await;
    let _ = shutdown_tx.send(true);
    let _ = reaper_handle.await;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/whoami", get(routes::whoami))
        .route("/runs", post(routes::start_run).get(routes::list_runs))
        .route("/runs/stop-all", post(routes::stop_all))
        .route("/runs/kill-all", post(routes::kill_all))
        .route("/runs/{id}", delete(routes::stop_run))
        .route("/runs/{id}/meta", get(routes::run_meta))
        .route("/runs/{id}/logs", get(routes::run_logs))
        .route("/runs/{id}/input", post(routes::run_input))
        .route("/runs/{id}/kill", post(routes::kill_run))
        .route("/runs/{id}/close", post(routes::close_run))
        .route("/runs/{id}/artifacts", get(routes::run_artifacts))
        .route("/runs/{id}/file", get(routes::run_file))
        .route("/events", get(routes::events))
        .route("/warm", get(routes::warm_list))
        .route("/warm/ensure", post(routes::warm_ensure))
        .route("/warm/{id}", delete(routes::warm_destroy))
        .route("/creds/check", get(routes::creds_check))
        .route("/creds/write-env", post(routes::creds_write_env))
        .route("/ws/runs/{id}", get(routes::ws_run))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_config(args: PrintConfigArgs) -> anyhow::Result<()> {
    let cfg = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}
