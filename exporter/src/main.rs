//! Ollama Fleet Exporter - polls Ollama nodes and serves cached metrics.

use std::env;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ollama_fleet_exporter::{app, AppState, Config};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    if env::args().any(|a| a == "--version" || a == "-V") {
        println!("ollama-fleet-exporter {}", VERSION);
        return Ok(());
    }

    // Load configuration
    let config_path = Config::config_path();
    let config = Config::load_from(&config_path)
        .map_err(|e| format!("Failed to load configuration from {}: {}", config_path, e))?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Ollama Fleet Exporter {}", VERSION);

    let state = AppState::build(&config, config_path.clone())?;
    tracing::info!("Exporting {} node(s) from {}", state.registry.len(), config_path);
    if let Some(port) = config.local.port {
        tracing::info!("Watching local connections on port {}", port);
    }

    state.collector.clone().spawn();

    let app = app(state);

    // Start server
    let addr = format!("{}:{}", config.exporter.host, config.exporter.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Exporter stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
