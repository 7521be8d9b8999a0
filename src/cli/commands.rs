//! CLI command implementations
//!
//! Boot order for `serve`:
//! 1. Load the application config
//! 2. Build datasources and load the model directory
//! 3. Resolve the registry
//! 4. Connect datasources
//! 5. Serve the REST API until the listener fails

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::write_response;
use crate::config::AppConfig;
use crate::model::Registry;
use crate::rest_api::RestServer;

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve { config } => serve(&config),
        Command::Check { config } => check(&config),
    }
}

/// Load config and models, then resolve the registry
pub fn boot(config_path: &Path) -> CliResult<(AppConfig, Arc<Registry>)> {
    let app = AppConfig::load(config_path)?;
    let registry = Registry::from_app_config(&app)?;
    tracing::info!(
        config = %config_path.display(),
        models = registry.models().count(),
        "registry resolved"
    );
    Ok((app, registry))
}

/// Serve the REST API
pub fn serve(config_path: &Path) -> CliResult<()> {
    let (app, registry) = boot(config_path)?;

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(async {
        registry.datasources().connect_all().await?;

        let server = RestServer::from_app_config(registry.clone(), &app);
        let served = server
            .serve(&app.socket_addr())
            .await
            .map_err(|e| CliError::io_error(format!("HTTP server failed: {}", e)));

        registry.datasources().disconnect_all().await;
        served
    })
}

/// Resolve without serving and print the model list
pub fn check(config_path: &Path) -> CliResult<()> {
    let (_app, registry) = boot(config_path)?;
    write_response(model_summary(&registry))
}

/// One entry per model: name, REST path segment, datasource and cache use
pub fn model_summary(registry: &Registry) -> Value {
    Value::Array(
        registry
            .models()
            .map(|model| {
                json!({
                    "name": model.name(),
                    "plural": model.plural(),
                    "datasource": model.datasource().name(),
                    "public": model.config().public,
                    "cached": model.is_cached(),
                })
            })
            .collect(),
    )
}
