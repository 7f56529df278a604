//! Price Predictor - retail price sensitivity inference service
//!
//! Serves predictions over HTTP from an ONNX classifier fetched from the
//! model store, falling back to a rule-based model when no artifact loads.

use anyhow::Result;
use predictor_lib::{ModelProvider, PredictionService, StructuredLogger};
use price_predictor::{api, config::ServiceConfig};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVICE_NAME: &str = "price-predictor";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting {}", SERVICE_NAME);

    let config = ServiceConfig::load()?;
    let provider_config = config.into_provider_config();
    info!(
        store = ?config.model_store,
        bucket = %provider_config.bucket,
        key = %provider_config.model_key,
        cache_path = %provider_config.cache_path.display(),
        "Service configured"
    );

    let logger = StructuredLogger::new(SERVICE_NAME);
    let provider = Arc::new(
        ModelProvider::with_onnx(provider_config, config.build_store()?)
            .with_logger(logger.clone()),
    );

    if config.model_eager_load {
        provider.get_model().await;
    }
    let model_version = provider.get_model_info().await.version;
    logger.log_startup(SERVICE_VERSION, &model_version, config.port);

    let service = Arc::new(PredictionService::new(provider).with_logger(logger.clone()));
    let app_state = Arc::new(api::AppState::new(service));

    // Wait for shutdown signal
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        logger.log_shutdown("SIGINT received");
    };

    api::serve(config.port, app_state, shutdown).await?;
    info!("Shutting down");

    Ok(())
}
