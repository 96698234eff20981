//! Standalone worker process entry point.
//!
//! Loads [`KiqConfig`] from `config/*.toml` layered with `KIQ_`-prefixed
//! environment variables (mirroring how the host application loads its own
//! configuration), builds a [`Supervisor`], and runs it until a shutdown
//! signal arrives. Embedding applications that register their own worker
//! types would normally call [`Supervisor::build`] directly from their own
//! binary instead of running this one; it exists so the engine is runnable
//! standalone against queues that only need the standard reporter chain.

use config::{Config, Environment, File};
use kiq::{KiqConfig, Supervisor, WorkerRegistry};
use std::path::Path;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_logging();

    info!("starting kiq-worker");
    info!(version = env!("CARGO_PKG_VERSION"), "version");

    if let Err(err) = run().await {
        error!(error = %err, "kiq-worker exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> kiq::KiqResult<()> {
    let config = load_config()?;

    if !config.server {
        info!("server = false; nothing to run (embed Kiq directly for enqueue-only hosts)");
        return Ok(());
    }

    info!(
        node_id = %config.node_id,
        queues = config.queues.len(),
        "loaded configuration"
    );

    // A standalone binary has no compiled-in worker types to register; an
    // embedding application builds its own `WorkerRegistry` and its own
    // binary around `Supervisor::build` instead. This process still drives
    // crash recovery, scheduling, and the reporter chain for any jobs
    // already in its queues.
    let registry = WorkerRegistry::new();

    let supervisor = std::sync::Arc::new(Supervisor::build(config, registry, Vec::new()).await?);
    let handles = supervisor.start().await?;

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight jobs");
    supervisor.shutdown(handles).await;

    Ok(())
}

/// Layered configuration load: `config/default.toml`, then
/// `config/<KIQ_ENVIRONMENT>.toml`, then `KIQ_`-prefixed environment
/// variables, mirroring the host application's own config loader.
fn load_config() -> kiq::KiqResult<KiqConfig> {
    if let Err(err) = dotenvy::dotenv() {
        tracing::debug!(error = %err, "no .env file found or error loading it");
    }

    let environment = std::env::var("KIQ_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    let mut builder = Config::builder();

    let default_path = "config/default.toml";
    if Path::new(default_path).exists() {
        builder = builder.add_source(File::with_name(default_path).required(false));
    }

    let env_path = format!("config/{environment}.toml");
    if Path::new(&env_path).exists() {
        builder = builder.add_source(File::with_name(&env_path).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("KIQ")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder
        .build()
        .map_err(|e| kiq::KiqError::Configuration(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| kiq::KiqError::Configuration(e.to_string()))
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kiq=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}
