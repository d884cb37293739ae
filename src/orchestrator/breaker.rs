//! Circuit Breaker
//!
//! Watches how many critical engines are down. Past the threshold it flips
//! the fleet into emergency mode: local protective state first, then a
//! best-effort protective stop to every sensitive engine.
//!
//! The local flags are plain atomics so the flip is a single store that any
//! reader observes without waiting on the remote stop calls.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::BreakerConfig;
use crate::error::FleetError;
use crate::fleet::{DescriptorTable, EngineDescriptor};
use crate::orchestrator::client::EngineClient;
use crate::orchestrator::event_bus::{EventBus, FleetEvent};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmergencyRecord {
    pub reason: String,
    pub critical_down: usize,
    pub threshold: usize,
    pub manual: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopOutcome {
    pub engine: String,
    pub success: bool,
    pub error: Option<String>,
}

pub struct CircuitBreaker {
    threshold: usize,
    targets: Vec<EngineDescriptor>,
    stop_timeout: Duration,
    client: Arc<dyn EngineClient>,
    bus: Arc<EventBus>,
    emergency: AtomicBool,
    trading_disabled: AtomicBool,
    record: OnceLock<EmergencyRecord>,
}

impl CircuitBreaker {
    pub fn new(
        config: &BreakerConfig,
        threshold: usize,
        descriptors: &DescriptorTable,
        client: Arc<dyn EngineClient>,
        bus: Arc<EventBus>,
    ) -> Self {
        let targets = config
            .protective_stop_engines
            .iter()
            .filter_map(|name| descriptors.get(name).cloned())
            .collect();
        Self {
            threshold,
            targets,
            stop_timeout: config.stop_timeout(),
            client,
            bus,
            emergency: AtomicBool::new(false),
            trading_disabled: AtomicBool::new(false),
            record: OnceLock::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    /// Local protective state ("global trading disabled").
    pub fn trading_disabled(&self) -> bool {
        self.trading_disabled.load(Ordering::SeqCst)
    }

    pub fn record(&self) -> Option<&EmergencyRecord> {
        self.record.get()
    }

    /// Called after every supervisor pass. Returns the protective-stop task
    /// when this call activated emergency mode.
    pub fn evaluate(&self, critical_down: usize) -> Option<JoinHandle<Vec<StopOutcome>>> {
        if critical_down <= self.threshold || self.is_emergency() {
            return None;
        }
        let err = FleetError::EmergencyEscalation { critical_down, threshold: self.threshold };
        self.activate(err.to_string(), critical_down, false)
    }

    /// Operator-triggered emergency.
    pub fn trigger_manual(&self, reason: impl Into<String>, critical_down: usize) -> Option<JoinHandle<Vec<StopOutcome>>> {
        self.activate(reason.into(), critical_down, true)
    }

    fn activate(&self, reason: String, critical_down: usize, manual: bool) -> Option<JoinHandle<Vec<StopOutcome>>> {
        // Local protection holds regardless of what happens on the network.
        self.trading_disabled.store(true, Ordering::SeqCst);

        if self
            .emergency
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }

        let at = Utc::now();
        let _ = self.record.set(EmergencyRecord {
            reason: reason.clone(),
            critical_down,
            threshold: self.threshold,
            manual,
            at,
        });

        error!(critical_down, threshold = self.threshold, manual, "EMERGENCY MODE ACTIVATED: {}", reason);
        self.bus.publish(FleetEvent::EmergencyActivated {
            critical_down,
            threshold: self.threshold,
            reason,
            manual,
            at,
        });

        let targets = self.targets.clone();
        let client = self.client.clone();
        let bus = self.bus.clone();
        let stop_timeout = self.stop_timeout;
        Some(tokio::spawn(async move { protective_stop_all(targets, client, bus, stop_timeout).await }))
    }
}

/// Fan out one stop command per target, each under its own timeout.
/// Failures are logged, never retried.
async fn protective_stop_all(
    targets: Vec<EngineDescriptor>,
    client: Arc<dyn EngineClient>,
    bus: Arc<EventBus>,
    stop_timeout: Duration,
) -> Vec<StopOutcome> {
    let calls = targets.iter().map(|engine| {
        let client = client.clone();
        async move {
            let error = match timeout(stop_timeout, client.protective_stop(engine)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("no answer within {:?}", stop_timeout)),
            };
            StopOutcome { engine: engine.name.clone(), success: error.is_none(), error }
        }
    });

    let outcomes = join_all(calls).await;
    for o in &outcomes {
        match &o.error {
            None => info!(engine = %o.engine, "protective stop acknowledged"),
            Some(e) => warn!(engine = %o.engine, "protective stop failed: {}", e),
        }
        bus.publish(FleetEvent::ProtectiveStop {
            engine: o.engine.clone(),
            success: o.success,
            error: o.error.clone(),
        });
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::fleet::{Opportunity, ScannedCandidate};
    use crate::orchestrator::client::ProbeReport;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl EngineClient for Unreachable {
        async fn probe(&self, e: &EngineDescriptor) -> Result<ProbeReport> {
            Err(FleetError::Transport { engine: e.name.clone(), reason: "unreachable".into() })
        }
        async fn list_opportunities(&self, e: &EngineDescriptor) -> Result<Vec<ScannedCandidate>> {
            Err(FleetError::Transport { engine: e.name.clone(), reason: "unreachable".into() })
        }
        async fn protective_stop(&self, e: &EngineDescriptor) -> Result<()> {
            Err(FleetError::Transport { engine: e.name.clone(), reason: "unreachable".into() })
        }
        async fn execute(&self, e: &EngineDescriptor, _: &Opportunity) -> Result<String> {
            Err(FleetError::Transport { engine: e.name.clone(), reason: "unreachable".into() })
        }
    }

    fn breaker(threshold: usize) -> CircuitBreaker {
        let table = DescriptorTable::new(vec![
            EngineDescriptor::new("executor", "http://x"),
            EngineDescriptor::new("risk", "http://y"),
        ]);
        let cfg = BreakerConfig {
            emergency_threshold: Some(threshold),
            stop_timeout_ms: 100,
            protective_stop_engines: vec!["executor".into(), "risk".into()],
        };
        CircuitBreaker::new(&cfg, threshold, &table, Arc::new(Unreachable), Arc::new(EventBus::new(16)))
    }

    #[tokio::test]
    async fn test_at_threshold_does_not_fire() {
        let b = breaker(2);
        assert!(b.evaluate(2).is_none());
        assert!(!b.is_emergency());
        assert!(!b.trading_disabled());
    }

    #[tokio::test]
    async fn test_fires_once_and_holds_locally_when_unreachable() {
        let b = breaker(2);
        let stops = b.evaluate(3).expect("should activate");
        assert!(b.is_emergency());
        assert!(b.trading_disabled());
        assert_eq!(b.record().unwrap().critical_down, 3);

        let outcomes = stops.await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.success));
        // Remote failure never unsets local protection.
        assert!(b.trading_disabled());

        assert!(b.evaluate(5).is_none());
        assert!(b.trigger_manual("again", 0).is_none());
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let b = breaker(10);
        assert!(b.trigger_manual("operator drill", 0).is_some());
        assert!(b.is_emergency());
        assert!(b.record().unwrap().manual);
    }
}
