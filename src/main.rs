use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use query_gateway::config::LogFormat;
use query_gateway::store::{IndexManager, MemoryStore, standard_indexes};
use query_gateway::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.with_thread_ids(true).init(),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    let config = match Config::from_env() {
        Ok(config) => {
            init_tracing(&config.log_level, config.log_format);
            config
        }
        Err(e) => {
            init_tracing("info", LogFormat::Pretty);
            error!("Configuration error: {e}");
            return Err(exitcode::CONFIG);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = config.environment.as_str(),
        host = %config.host,
        port = config.port,
        "Starting query gateway"
    );

    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    } else {
        info!("Prometheus metrics disabled (METRICS_PORT=0)");
    }

    let store = match &config.seed_file {
        Some(path) => MemoryStore::load(path).await.map_err(|e| {
            error!("Failed to load seed data: {e}");
            exitcode::NOINPUT
        })?,
        None => {
            warn!("No SEED_FILE set, starting with an empty store");
            MemoryStore::new()
        }
    };
    let store = Arc::new(store);

    if config.ensure_indexes_on_startup {
        match store.ensure_indexes(&standard_indexes()).await {
            Ok(created) => info!(created = created.len(), "Indexes ensured"),
            // Queries degrade to their fallbacks without indexes.
            Err(e) => warn!(error = %e, "Failed to ensure indexes"),
        }
    } else {
        info!("Index creation on startup disabled; text and geo queries will use fallbacks");
    }

    let state = AppState::new(config.clone(), store);
    let app = build_router(state);

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health                              - Health check");
    info!("  GET  /queries                             - List catalog queries");
    info!("  GET  /queries/{{id}}                        - Describe a catalog query");
    info!("  POST /data/execute/{{queryId}}              - Run a catalog query");
    info!("  POST /data/execute-custom/{{collection}}    - Run a custom read query");
    info!("  GET  /data/stats                          - Collection statistics");
    info!("  POST /admin/ensure-indexes                - Create missing indexes");

    let started = Instant::now();
    let shutdown = async move {
        let signal = utils::wait_for_shutdown().await;
        warn!(
            %signal,
            uptime_secs = started.elapsed().as_secs(),
            "Shutdown signal received, draining in-flight requests"
        );
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!("Server error: {e}");
            exitcode::SOFTWARE
        })?;

    info!("Server shutdown complete");
    Ok(())
}
