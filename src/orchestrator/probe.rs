//! Health Prober
//!
//! Issues one liveness check against one engine and classifies the result.
//! Each probe carries its own timeout; a probe that outlives it is abandoned
//! and its late result discarded.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use crate::error::FleetError;
use crate::fleet::EngineDescriptor;
use crate::orchestrator::client::EngineClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Healthy { latency_ms: u64 },
    Unhealthy { latency_ms: u64, reason: String },
    Timeout { after_ms: u64 },
    Error { reason: String },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy { .. })
    }

    pub fn latency_ms(&self) -> Option<u64> {
        match self {
            ProbeOutcome::Healthy { latency_ms } | ProbeOutcome::Unhealthy { latency_ms, .. } => Some(*latency_ms),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ProbeOutcome::Healthy { latency_ms } => format!("healthy ({} ms)", latency_ms),
            ProbeOutcome::Unhealthy { reason, .. } => format!("unhealthy: {}", reason),
            ProbeOutcome::Timeout { after_ms } => format!("timed out after {} ms", after_ms),
            ProbeOutcome::Error { reason } => format!("error: {}", reason),
        }
    }

    /// The taxonomy error for a failed probe, if any.
    pub fn to_error(&self, engine: &str) -> Option<FleetError> {
        match self {
            ProbeOutcome::Healthy { .. } => None,
            ProbeOutcome::Timeout { after_ms } => Some(FleetError::ProbeTimeout {
                engine: engine.to_string(),
                timeout: Duration::from_millis(*after_ms),
            }),
            ProbeOutcome::Unhealthy { reason, .. } | ProbeOutcome::Error { reason } => Some(FleetError::ProbeError {
                engine: engine.to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub engine: String,
    pub outcome: ProbeOutcome,
    pub at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn new(engine: impl Into<String>, outcome: ProbeOutcome) -> Self {
        Self { engine: engine.into(), outcome, at: Utc::now() }
    }

    /// Engines without a health path are deemed healthy once started.
    pub fn assumed_healthy(engine: impl Into<String>) -> Self {
        Self::new(engine, ProbeOutcome::Healthy { latency_ms: 0 })
    }
}

#[derive(Clone)]
pub struct HealthProber {
    client: Arc<dyn EngineClient>,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(client: Arc<dyn EngineClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn probe(&self, engine: &EngineDescriptor) -> ProbeResult {
        if !engine.has_health_check() {
            return ProbeResult::assumed_healthy(&engine.name);
        }

        let started = Instant::now();
        let outcome = match timeout(self.timeout, self.client.probe(engine)).await {
            Ok(Ok(report)) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                if report.healthy {
                    ProbeOutcome::Healthy { latency_ms }
                } else {
                    ProbeOutcome::Unhealthy {
                        latency_ms,
                        reason: report.detail.unwrap_or_else(|| "reported unhealthy".to_string()),
                    }
                }
            }
            Ok(Err(e)) => ProbeOutcome::Error { reason: e.to_string() },
            Err(_) => ProbeOutcome::Timeout { after_ms: self.timeout.as_millis() as u64 },
        };

        ProbeResult::new(&engine.name, outcome)
    }

    /// Scatter-gather: every probe runs concurrently and the batch completes
    /// when each member has answered or hit its own timeout.
    pub async fn probe_all(&self, engines: &[EngineDescriptor]) -> Vec<ProbeResult> {
        join_all(engines.iter().map(|e| self.probe(e))).await
    }

    /// Poll until the engine reports healthy or `deadline` elapses. On
    /// timeout the last observed result is returned as the error.
    pub async fn wait_until_ready(
        &self,
        engine: &EngineDescriptor,
        poll_interval: Duration,
        deadline: Duration,
    ) -> std::result::Result<ProbeResult, ProbeResult> {
        let mut last: Option<ProbeResult> = None;

        let polled = timeout(deadline, async {
            loop {
                let result = self.probe(engine).await;
                if result.outcome.is_healthy() {
                    return result;
                }
                last = Some(result);
                sleep(poll_interval).await;
            }
        })
        .await;

        match polled {
            Ok(result) => Ok(result),
            Err(_) => Err(last.unwrap_or_else(|| {
                ProbeResult::new(&engine.name, ProbeOutcome::Timeout { after_ms: deadline.as_millis() as u64 })
            })),
        }
    }
}
