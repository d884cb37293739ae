//! State Broadcaster
//!
//! Assembles [`SystemSnapshot`]s from the read-only views the other
//! components publish, and pushes them to observers: immediately when the
//! fleet materially changes, and on a heartbeat cadence regardless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::fleet::{EngineRuntimeState, EngineState, Opportunity, Priority};
use crate::orchestrator::breaker::{CircuitBreaker, EmergencyRecord};
use crate::orchestrator::circuit::{CallCircuits, CircuitStatus};
use crate::orchestrator::event_bus::{EventBus, FleetEvent};
use crate::orchestrator::failures::{failure_report, uptime_percentage};
use crate::orchestrator::harvest::{HarvestMode, HarvestRouter};
use crate::orchestrator::health::{EngineCounts, RegistrySnapshot};
use crate::orchestrator::pipeline::{ActiveSet, CycleReport};
use crate::orchestrator::scoring::coherence_factor;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineView {
    pub name: String,
    pub priority: Priority,
    pub endpoint: String,
    pub auto_restart: bool,
    pub runtime: EngineRuntimeState,
    pub health_score: f64,
    /// Absent until the pipeline has called the engine.
    pub call_circuit: Option<CircuitStatus>,
}

/// Overall fleet classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    Healthy,
    Degraded,
    Critical,
}

impl SystemStatus {
    /// Engines that are FAILED, RECOVERING or DEAD count as failed. More than
    /// half of the fleet failed is CRITICAL, any failure at all is DEGRADED.
    pub fn classify(counts: &EngineCounts) -> Self {
        let total = counts.total();
        let failed = counts.failed + counts.recovering + counts.dead;
        if failed == 0 {
            SystemStatus::Healthy
        } else if failed * 2 > total {
            SystemStatus::Critical
        } else {
            SystemStatus::Degraded
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemSnapshot {
    pub generated_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub engines: Vec<EngineView>,
    pub counts: EngineCounts,
    pub overall_status: SystemStatus,
    /// Time since the first recorded failure without an open failure, in percent.
    pub uptime_percentage: f64,
    /// Failures recorded in the last hour.
    pub recent_failures: usize,
    /// Fraction of engines HEALTHY; the multiplier used in scoring.
    pub coherence: f64,
    pub critical_down: usize,
    pub emergency_threshold: usize,
    pub emergency_mode: bool,
    pub trading_disabled: bool,
    pub emergency: Option<EmergencyRecord>,
    pub harvest_mode: HarvestMode,
    pub active_opportunities: Vec<Opportunity>,
    pub last_cycle: Option<CycleReport>,
}

/// Cloneable read handle over everything a snapshot is built from.
#[derive(Clone)]
pub struct StateView {
    started_at: DateTime<Utc>,
    registry_rx: watch::Receiver<Arc<RegistrySnapshot>>,
    active_rx: watch::Receiver<Arc<ActiveSet>>,
    breaker: Arc<CircuitBreaker>,
    router: Arc<HarvestRouter>,
    circuits: Arc<CallCircuits>,
}

impl StateView {
    pub fn new(
        registry_rx: watch::Receiver<Arc<RegistrySnapshot>>,
        active_rx: watch::Receiver<Arc<ActiveSet>>,
        breaker: Arc<CircuitBreaker>,
        router: Arc<HarvestRouter>,
        circuits: Arc<CallCircuits>,
    ) -> Self {
        Self { started_at: Utc::now(), registry_rx, active_rx, breaker, router, circuits }
    }

    pub fn registry(&self) -> Arc<RegistrySnapshot> {
        self.registry_rx.borrow().clone()
    }

    pub async fn snapshot(&self) -> SystemSnapshot {
        let registry = self.registry();
        let active = self.active_rx.borrow().clone();
        let now = Utc::now();
        let counts = registry.counts();
        let mut circuits = self.circuits.statuses();

        let engines = registry
            .engines
            .iter()
            .map(|e| EngineView {
                name: e.descriptor.name.clone(),
                priority: e.descriptor.priority,
                endpoint: e.descriptor.endpoint.clone(),
                auto_restart: e.descriptor.auto_restart,
                health_score: e.runtime.health_score(now),
                runtime: e.runtime.clone(),
                call_circuit: circuits.remove(&e.descriptor.name),
            })
            .collect();

        SystemSnapshot {
            generated_at: now,
            uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
            engines,
            coherence: coherence_factor(counts.healthy, registry.engines.len()),
            overall_status: SystemStatus::classify(&counts),
            uptime_percentage: uptime_percentage(&registry.failures, now),
            recent_failures: failure_report(&registry.failures, 1, now).total,
            counts,
            critical_down: registry.critical_down(),
            emergency_threshold: self.breaker.threshold(),
            emergency_mode: self.breaker.is_emergency(),
            trading_disabled: self.breaker.trading_disabled(),
            emergency: self.breaker.record().cloned(),
            harvest_mode: self.router.mode().await,
            active_opportunities: active.opportunities.clone(),
            last_cycle: active.last_report.clone(),
        }
    }
}

/// What counts as a material change worth an immediate push.
#[derive(Debug, PartialEq)]
struct Signature {
    states: Vec<EngineState>,
    emergency: bool,
    cycle: u64,
    completed: Option<u64>,
    active: usize,
}

pub struct StateBroadcaster {
    view: StateView,
    bus: Arc<EventBus>,
    heartbeat: Duration,
}

impl StateBroadcaster {
    pub fn new(view: StateView, bus: Arc<EventBus>, heartbeat: Duration) -> Self {
        Self { view, bus, heartbeat }
    }

    fn signature(&self) -> Signature {
        let registry = self.view.registry();
        let active = self.view.active_rx.borrow().clone();
        Signature {
            states: registry.engines.iter().map(|e| e.runtime.state).collect(),
            emergency: self.view.breaker.is_emergency(),
            cycle: active.cycle,
            completed: active.last_report.as_ref().map(|r| r.cycle),
            active: active.len(),
        }
    }

    pub async fn run(self) {
        info!(heartbeat_ms = self.heartbeat.as_millis() as u64, "State broadcaster online");

        let mut registry_rx = self.view.registry_rx.clone();
        let mut active_rx = self.view.active_rx.clone();
        let mut ticker = interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = self.signature();

        loop {
            tokio::select! {
                changed = registry_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let _ = registry_rx.borrow_and_update();
                    last = self.push_if_changed(last).await;
                }
                changed = active_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let _ = active_rx.borrow_and_update();
                    last = self.push_if_changed(last).await;
                }
                _ = ticker.tick() => {
                    let snapshot = self.view.snapshot().await;
                    self.bus.publish(FleetEvent::Heartbeat(Box::new(snapshot)));
                }
            }
        }
        debug!("State broadcaster stopped: state sources closed");
    }

    async fn push_if_changed(&self, last: Signature) -> Signature {
        let current = self.signature();
        if current != last {
            let snapshot = self.view.snapshot().await;
            self.bus.publish(FleetEvent::StateSnapshot(Box::new(snapshot)));
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(healthy: usize, degraded: usize, failed: usize, recovering: usize, dead: usize) -> EngineCounts {
        EngineCounts { healthy, degraded, failed, recovering, dead, ..Default::default() }
    }

    #[test]
    fn test_overall_status() {
        assert_eq!(SystemStatus::classify(&EngineCounts::default()), SystemStatus::Healthy);
        assert_eq!(SystemStatus::classify(&counts(3, 1, 0, 0, 0)), SystemStatus::Healthy);
        assert_eq!(SystemStatus::classify(&counts(2, 0, 1, 1, 0)), SystemStatus::Degraded);
        assert_eq!(SystemStatus::classify(&counts(1, 0, 1, 0, 0)), SystemStatus::Degraded);
        assert_eq!(SystemStatus::classify(&counts(1, 0, 1, 0, 1)), SystemStatus::Critical);
    }
}
