#![forbid(unsafe_code)]

//! `stay-concierge` server binary.
//!
//! Bootstraps configuration and the database, then runs the orchestration
//! and archive loops, the HTTP API, and the IPC server for
//! `stay-concierge-ctl` until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use stay_concierge::config::GlobalConfig;
use stay_concierge::notifier::webhook::WebhookNotifier;
use stay_concierge::oracle::http::HttpOracle;
use stay_concierge::orchestrator::{pass, Engine};
use stay_concierge::persistence::db;
use stay_concierge::state::AppState;
use stay_concierge::{http, ipc, AppError, Result};

const IPC_TOKEN_ENV: &str = "CONCIERGE_IPC_TOKEN";

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "stay-concierge", about = "Guest-service task orchestration server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured database path.
    #[arg(long)]
    db: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("stay-concierge server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(db_path) = args.db {
        config.db_path = db_path;
    }
    config.load_credentials().await?;
    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path).await?);
    info!(db_path = %config.db_path.display(), "database connected");

    // ── Collaborators and engine ────────────────────────
    let oracle = Arc::new(HttpOracle::new(&config.oracle)?);
    let notifier = Arc::new(WebhookNotifier::new(&config.notifier)?);
    let engine = Engine::new(Arc::clone(&config), db, oracle, notifier)?;

    let ipc_auth_token = std::env::var(IPC_TOKEN_ENV)
        .ok()
        .filter(|token| !token.trim().is_empty());
    if ipc_auth_token.is_none() {
        warn!("{IPC_TOKEN_ENV} not set; ipc commands are unauthenticated");
    }

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        engine: engine.clone(),
        ipc_auth_token,
    });

    // ── Background loops ────────────────────────────────
    let ct = CancellationToken::new();
    let orchestration_handle = pass::spawn_orchestration_task(engine.clone(), ct.clone());
    let archive_handle = pass::spawn_archive_task(engine, ct.clone());
    info!("orchestration and archive loops started");

    // ── Surfaces ────────────────────────────────────────
    let ipc_handle = ipc::server::spawn_ipc_server(Arc::clone(&state), ct.clone())?;

    let http_ct = ct.clone();
    let http_state = Arc::clone(&state);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve(http_state, http_ct).await {
            error!(%err, "http api failed");
        }
    });

    info!("stay-concierge ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = tokio::join!(orchestration_handle, archive_handle, ipc_handle, http_handle);
    info!("stay-concierge shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
