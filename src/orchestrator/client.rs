//! Engine Transport
//!
//! Every outbound call to an engine goes through [`EngineClient`]. Callers
//! wrap each call in their own timeout; the client never retries.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{FleetError, Result};
use crate::fleet::{EngineDescriptor, Opportunity, ScannedCandidate};

pub const DEFAULT_STOP_PATH: &str = "/api/emergency/stop";
pub const DEFAULT_EXECUTE_PATH: &str = "/api/execute";

const HEALTHY_STATUSES: &[&str] = &["healthy", "ok", "up", "running", "active"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeReport {
    pub healthy: bool,
    /// Free-form status body, if any.
    pub detail: Option<String>,
}

impl ProbeReport {
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self { healthy: true, detail: Some(detail.into()) }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self { healthy: false, detail: Some(detail.into()) }
    }
}

#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Liveness check against the engine's health endpoint.
    async fn probe(&self, engine: &EngineDescriptor) -> Result<ProbeReport>;

    /// Candidate opportunities currently offered by the engine.
    async fn list_opportunities(&self, engine: &EngineDescriptor) -> Result<Vec<ScannedCandidate>>;

    /// Idempotent protective stop.
    async fn protective_stop(&self, engine: &EngineDescriptor) -> Result<()>;

    /// Submit a crystallized opportunity for execution. Returns the engine's
    /// acknowledgement body.
    async fn execute(&self, engine: &EngineDescriptor, opportunity: &Opportunity) -> Result<String>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OpportunityListing {
    Bare(Vec<ScannedCandidate>),
    Wrapped { opportunities: Vec<ScannedCandidate> },
}

/// JSON-over-HTTP engine client.
#[derive(Clone)]
pub struct HttpEngineClient {
    http: Client,
}

impl HttpEngineClient {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| FleetError::invalid(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    fn transport(engine: &EngineDescriptor, err: impl std::fmt::Display) -> FleetError {
        FleetError::Transport { engine: engine.name.clone(), reason: err.to_string() }
    }
}

/// Classify a liveness response body. Non-JSON bodies and JSON without a
/// `status` field count as healthy when the HTTP status was 2xx.
pub fn classify_health_body(body: &str) -> ProbeReport {
    let detail = if body.trim().is_empty() { None } else { Some(body.to_string()) };
    let status = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("status").and_then(Value::as_str).map(str::to_lowercase));

    let healthy = match status {
        Some(s) => HEALTHY_STATUSES.contains(&s.as_str()),
        None => true,
    };
    ProbeReport { healthy, detail }
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    async fn probe(&self, engine: &EngineDescriptor) -> Result<ProbeReport> {
        let Some(path) = &engine.health_path else {
            return Ok(ProbeReport::healthy("no health check declared"));
        };

        let resp = self
            .http
            .get(engine.url_for(path))
            .send()
            .await
            .map_err(|e| FleetError::ProbeError { engine: engine.name.clone(), reason: e.to_string() })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Ok(ProbeReport::unhealthy(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        Ok(classify_health_body(&body))
    }

    async fn list_opportunities(&self, engine: &EngineDescriptor) -> Result<Vec<ScannedCandidate>> {
        let Some(path) = &engine.opportunity_path else {
            return Ok(Vec::new());
        };

        let resp = self
            .http
            .get(engine.url_for(path))
            .send()
            .await
            .map_err(|e| FleetError::ScanFailure { engine: engine.name.clone(), reason: e.to_string() })?;

        if !resp.status().is_success() {
            return Err(FleetError::ScanFailure {
                engine: engine.name.clone(),
                reason: format!("HTTP {}", resp.status().as_u16()),
            });
        }

        let listing: OpportunityListing = resp
            .json()
            .await
            .map_err(|e| FleetError::ScanFailure { engine: engine.name.clone(), reason: e.to_string() })?;

        let candidates = match listing {
            OpportunityListing::Bare(list) => list,
            OpportunityListing::Wrapped { opportunities } => opportunities,
        };
        debug!(engine = %engine.name, count = candidates.len(), "scan listing received");
        Ok(candidates)
    }

    async fn protective_stop(&self, engine: &EngineDescriptor) -> Result<()> {
        let path = engine.stop_path.as_deref().unwrap_or(DEFAULT_STOP_PATH);
        let resp = self
            .http
            .post(engine.url_for(path))
            .json(&serde_json::json!({ "reason": "emergency" }))
            .send()
            .await
            .map_err(|e| Self::transport(engine, e))?;

        if !resp.status().is_success() {
            return Err(Self::transport(engine, format!("HTTP {}", resp.status().as_u16())));
        }
        Ok(())
    }

    async fn execute(&self, engine: &EngineDescriptor, opportunity: &Opportunity) -> Result<String> {
        let id = opportunity.id.map(|u| u.to_string()).unwrap_or_default();
        let resp = self
            .http
            .post(engine.url_for(DEFAULT_EXECUTE_PATH))
            .json(opportunity)
            .send()
            .await
            .map_err(|e| FleetError::HarvestFailure { opportunity: id.clone(), reason: e.to_string() })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(FleetError::HarvestFailure {
                opportunity: id,
                reason: format!("HTTP {}: {}", status.as_u16(), body),
            });
        }
        Ok(body)
    }
}
