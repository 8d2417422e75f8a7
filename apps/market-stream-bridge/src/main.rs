//! Market Stream Bridge Binary
//!
//! Starts the book and position stream services with their control API and
//! health endpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-stream-bridge
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `BRIDGE_UPSTREAM_URL`: Upstream REST base URL (http connector only)
//!
//! ## Optional
//! - `BRIDGE_CONNECTOR`: http | simulated (default: http)
//! - `BRIDGE_UPSTREAM_TOKEN`: Bearer token for the upstream
//! - `BRIDGE_API_PORT`: Control API port (default: 8090)
//! - `BRIDGE_HEALTH_PORT`: Health check and metrics port (default: 8091)
//! - `BRIDGE_BOOK_POLL_INTERVAL_MS`, `BRIDGE_POSITION_POLL_INTERVAL_MS`
//! - `BRIDGE_FETCH_TIMEOUT_MS`, `BRIDGE_STOP_GRACE_MS`,
//!   `BRIDGE_CONNECTION_CHECK_INTERVAL_MS`
//! - `BRIDGE_BOOK_TOPIC_CAPACITY`, `BRIDGE_POSITION_TOPIC_CAPACITY`,
//!   `BRIDGE_DEFAULT_BOOK_DEPTH`
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log filter (default: `market_stream_bridge=info`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_stream_bridge::application::ports::{BookConnector, PositionConnector};
use market_stream_bridge::infrastructure::health::{HealthServer, HealthServerState};
use market_stream_bridge::infrastructure::http::ApiServer;
use market_stream_bridge::infrastructure::telemetry;
use market_stream_bridge::{
    BookService, BridgeConfig, ConnectorKind, HttpConnector, PositionService, SimulatedConnector,
    init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Stream Bridge");

    if let Err(e) = init_metrics() {
        tracing::error!(error = %e, "Failed to install metrics recorder");
    }

    let config = BridgeConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let (book_connector, position_connector) = build_connectors(&config)?;
    let books = Arc::new(BookService::new(book_connector, config.book_stream()));
    let positions = Arc::new(PositionService::new(
        position_connector,
        config.position_stream(),
    ));
    books.spawn_connection_monitor();
    positions.spawn_connection_monitor();

    let shutdown_token = CancellationToken::new();

    let api_server = ApiServer::new(
        config.server.api_port,
        Arc::clone(&books),
        Arc::clone(&positions),
        shutdown_token.child_token(),
    );
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&books),
        Arc::clone(&positions),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.child_token(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Market stream bridge ready");

    await_shutdown(shutdown_token).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        tokio::join!(books.shutdown(), positions.shutdown());
        let _ = tokio::join!(api_task, health_task);
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out"
        );
    }

    tracing::info!("Market stream bridge stopped");
    Ok(())
}

/// Build the connector pair selected by configuration.
fn build_connectors(config: &BridgeConfig) -> anyhow::Result<(BookConnector, PositionConnector)> {
    match config.connector {
        ConnectorKind::Http => {
            let upstream = config
                .upstream
                .as_ref()
                .context("BRIDGE_UPSTREAM_URL is required for the http connector")?;
            let connector = Arc::new(
                HttpConnector::new(upstream, config.timing.fetch_timeout)
                    .context("failed to build upstream client")?,
            );
            let books: BookConnector = connector.clone();
            let positions: PositionConnector = connector;
            Ok((books, positions))
        }
        ConnectorKind::Simulated => {
            let connector = Arc::new(SimulatedConnector::new());
            let books: BookConnector = connector.clone();
            let positions: PositionConnector = connector;
            Ok((books, positions))
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &BridgeConfig) {
    tracing::info!(
        connector = config.connector.as_str(),
        api_port = config.server.api_port,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        upstream = ?config.upstream,
        book_poll = ?config.books.poll_interval,
        position_poll = ?config.positions.poll_interval,
        fetch_timeout = ?config.timing.fetch_timeout,
        "Stream settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
