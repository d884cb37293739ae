//! One-shot fleet probe: checks every declared engine once, concurrently.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use fleet_orchestrator::config::{OrchestratorConfig, DEFAULT_CONFIG_PATH};
use fleet_orchestrator::orchestrator::{HealthProber, HttpEngineClient, ProbeOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FLEET_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = OrchestratorConfig::load(&path).await?;
    config.validate()?;

    let timeout = config.health.probe_timeout();
    let client = Arc::new(HttpEngineClient::new(Duration::from_millis(config.health.probe_timeout_ms))?);
    let prober = HealthProber::new(client, timeout);

    let results = prober.probe_all(config.engines.engines()).await;

    println!("{:<24} {:<10} {:<10} {:>10}  DETAIL", "ENGINE", "PRIORITY", "RESULT", "LATENCY");
    let mut unhealthy = 0;
    for (engine, result) in config.engines.engines().iter().zip(&results) {
        let label = match &result.outcome {
            ProbeOutcome::Healthy { .. } => "healthy",
            ProbeOutcome::Unhealthy { .. } => "unhealthy",
            ProbeOutcome::Timeout { .. } => "timeout",
            ProbeOutcome::Error { .. } => "error",
        };
        if !result.outcome.is_healthy() {
            unhealthy += 1;
        }
        let latency = result
            .outcome
            .latency_ms()
            .map(|ms| format!("{} ms", ms))
            .unwrap_or_else(|| "-".to_string());
        let detail = if engine.has_health_check() { result.outcome.describe() } else { "no health check".to_string() };
        println!("{:<24} {:<10} {:<10} {:>10}  {}", engine.name, engine.priority.to_string(), label, latency, detail);
    }

    println!("\n{}/{} engines healthy", results.len() - unhealthy, results.len());
    if unhealthy > 0 {
        std::process::exit(1);
    }
    Ok(())
}
