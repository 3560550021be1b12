pub mod api;
pub mod config;
pub mod pipeline;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::api::{start_api_server_on, ApiContext, ServerError};
use crate::config::{ConfigError, ServiceConfig};
use crate::pipeline::{AnalysisPipeline, Model, ModelLoadError};

/// Anything that stops the service from coming up.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Model load failed: {0}")]
    ModelLoad(#[from] ModelLoadError),
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
    #[error("Signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}

/// Install the global subscriber. `RUST_LOG` wins over `CXR_LOG`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
}

/// Load the model, serve until Ctrl-C, then drain in-flight requests.
///
/// The model is loaded before the listener binds; a missing or broken
/// export fails startup instead of the first request.
pub async fn run() -> Result<(), StartupError> {
    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let config = ServiceConfig::from_env()?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        ig_steps = config.ig_steps,
        ig_method = %config.ig_method,
        colormap = %config.colormap,
        "Configuration loaded"
    );

    let model = Arc::new(Model::load(&config.model_dir, config.intra_threads)?);
    let pipeline = Arc::new(AnalysisPipeline::from_config(model, &config));
    let ctx = ApiContext::new(pipeline, config.max_upload_bytes);

    let mut server = start_api_server_on(ctx, config.bind_addr).await?;
    tracing::info!(
        addr = %server.session.server_addr,
        session_id = %server.session.session_id,
        "Listening"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, shutting down");
    server.shutdown();
    server.wait().await?;

    Ok(())
}
