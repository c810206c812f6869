use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gatehouse::{
    Config, ConsulSource, GatewayState, RedisCounterStore, build_router, metrics, utils,
};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting gatehouse v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the gateway, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = config.port,
        consul = %config.consul_address,
        key = %config.config_key,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    } else {
        info!("Metrics exporter disabled (METRICS_PORT=0)");
    }

    let store = RedisCounterStore::connect(&config.redis_url)
        .await
        .map_err(|e| {
            error!("Failed to connect to Redis: {e}");
            exitcode::UNAVAILABLE
        })?;

    let source = ConsulSource::new(
        config.consul_address.clone(),
        config.consul_token.clone(),
        config.config_watch_wait,
    )
    .map_err(|e| {
        error!("Failed to build Consul client: {e}");
        exitcode::SOFTWARE
    })?;

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;

    let state = GatewayState::new(config, Arc::new(source), Arc::new(store)).map_err(|e| {
        error!("Failed to initialize gateway: {e}");
        exitcode::SOFTWARE
    })?;
    state.start().await;

    let app = build_router(state.clone());
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Gateway listening on http://{addr}");
    info!("  GET  /health  - Liveness with routing and breaker status");
    info!("  GET  /ready   - 200 once routing configuration is loaded");
    info!("  *    /*       - Dispatched per routing configuration");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Gateway shutdown complete");
    Ok(())
}
