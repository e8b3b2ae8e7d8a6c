#![forbid(unsafe_code)]

//! **sos-service** – The SOS platform binary.
//!
//! Boots the services bundle, serves the engine's HTTP surface, and runs
//! the daemon loops (worker first, then the claim loop, per the startup
//! ordering guarantee). One SIGINT/SIGTERM stops everything gracefully.
//!
//! ```bash
//! # Run with defaults (127.0.0.1:6060, ~/.sos)
//! sos
//!
//! # Strict capability mode on a custom port
//! SOS_STRICT_CAPABILITIES=1 sos --bind 127.0.0.1:7070
//!
//! # Engine only; workers run in separate processes
//! sos --no-worker
//! ```

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sos_daemon::{Daemon, DaemonConfig};
use sos_engine::{router, Engine};
use sos_runtime::{Services, SosConfig};
use sos_worker::{ModelExecutor, Worker};

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "sos")]
#[command(about = "SOS - autonomous multi-agent execution platform")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the engine bind address
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,

    /// Force strict capability mode regardless of environment
    #[arg(long)]
    strict: bool,

    /// Do not launch the in-process worker consumer
    #[arg(long)]
    no_worker: bool,

    /// Identifier for the in-process worker
    #[arg(long)]
    worker_id: Option<String>,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    info!("starting SOS v{}", env!("CARGO_PKG_VERSION"));

    let mut config = SosConfig::from_env().context("load configuration")?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if cli.strict {
        config.strict_capabilities = true;
    }
    let bind_addr = config.bind_addr;

    let services = Services::initialize(config).await?;
    let engine = Engine::new(services.clone());

    // Worker-start precedes the claim loop inside Daemon::start, so the
    // first publish already has a consumer group waiting.
    let worker = if cli.no_worker {
        None
    } else {
        let worker_id = cli
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple()));
        let executor = Arc::new(ModelExecutor::new(services.clone()));
        Some(Arc::new(Worker::new(services.clone(), executor, &worker_id)?))
    };

    let mut daemon_config = DaemonConfig::default();
    daemon_config.claim_interval = services.config.task_polling_interval;
    let mut daemon = Daemon::new(services.clone(), daemon_config);
    daemon.start(worker).await?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;
    info!("engine listening on http://{bind_addr}");
    let server = axum::serve(listener, router(engine)).into_future();

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("http server error: {e}");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    daemon.stop().await;
    info!("SOS stopped");
    Ok(())
}

//─────────────────────────────
//  Utility functions
//─────────────────────────────

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("sos={log_level},sos_service={log_level},sos_engine={log_level},sos_daemon={log_level},sos_worker={log_level},sos_gateway={log_level},sos_bus={log_level},sos_task_store={log_level},sos_runtime={log_level}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
