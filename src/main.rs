//! Fleet Orchestrator daemon
//!
//! Boots the fleet in dependency order, then supervises it until ctrl-c.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use fleet_orchestrator::config::{OrchestratorConfig, DEFAULT_CONFIG_PATH};
use fleet_orchestrator::orchestrator::{HttpEngineClient, Orchestrator, ProcessLauncher};
use fleet_orchestrator::server::{run_server, AppState};
use fleet_orchestrator::utils::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let log_dir = std::env::var("FLEET_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let _telemetry = init_telemetry("fleet_orchestrator", &log_dir)?;

    let config_path = std::env::var("FLEET_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = OrchestratorConfig::load(&config_path)
        .await
        .with_context(|| format!("loading {}", config_path))?;
    config.apply_env_overrides()?;
    info!(path = %config_path, engines = config.engines.len(), "Configuration loaded");

    let client = Arc::new(HttpEngineClient::new(Duration::from_millis(config.health.probe_timeout_ms))?);
    let launcher = Arc::new(ProcessLauncher::new());
    let bind = config.server.bind.clone();

    let orchestrator = Orchestrator::new(config, client, launcher)?;
    let (handle, report) = orchestrator.start().await?;
    for failure in &report.failed {
        warn!(engine = %failure.engine, "not ready after startup: {}", failure.error);
    }

    let state = AppState { orchestrator: handle.clone() };
    tokio::select! {
        result = run_server(state, &bind) => {
            if let Err(e) = result {
                error!("Operator API stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received");
        }
    }

    handle.shutdown();
    info!("Fleet orchestrator stopped");
    Ok(())
}
