use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use hed_edge_server::{AppState, EdgeDetector, HedModel, PreprocessorConfig, ServerConfig, create_router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ServerConfig::from_env();
    info!(
        host = %config.host,
        port = config.port,
        model_dir = %config.model_dir.display(),
        production = config.is_production(),
        "Starting hed_edge_server"
    );

    // The network is loaded before the listener binds; failure is fatal.
    let detector = match load_detector(&config) {
        Ok(detector) => detector,
        Err(e) => {
            error!("Failed to load edge detection model: {}", e);
            std::process::exit(1);
        }
    };

    let app = create_router(AppState::new(detector), &config);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn load_detector(config: &ServerConfig) -> Result<EdgeDetector, hed_edge_server::ModelError> {
    let preprocessor_config = PreprocessorConfig::load(&config.model_dir)?;
    info!(?preprocessor_config, "Preprocessor config loaded");

    let model = HedModel::new(&config.model_dir, config.intra_threads)?;
    Ok(EdgeDetector::new(Arc::new(model), preprocessor_config))
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hed_edge_server=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install CTRL+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
