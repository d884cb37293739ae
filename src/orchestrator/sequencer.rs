//! Startup Sequencer
//!
//! Runs once at boot. Launches engines in dependency order (ties broken by
//! priority) and waits for each to become ready before moving on. An engine
//! whose dependencies are not ready fails fast instead of blocking; it is
//! left FAILED for the recovery controller to pick up.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::StartupConfig;
use crate::error::{FleetError, Result};
use crate::fleet::{DescriptorTable, EngineDescriptor, EngineState};
use crate::orchestrator::event_bus::EventBus;
use crate::orchestrator::failures::FailureKind;
use crate::orchestrator::health::{announce, EngineRegistry, Transition};
use crate::orchestrator::launcher::EngineLauncher;
use crate::orchestrator::probe::{HealthProber, ProbeResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupFailure {
    pub engine: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartupReport {
    /// Order in which engines were considered.
    pub order: Vec<String>,
    pub healthy: Vec<String>,
    pub failed: Vec<StartupFailure>,
    pub duration_ms: u64,
}

impl StartupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct StartupSequencer {
    descriptors: Arc<DescriptorTable>,
    launcher: Arc<dyn EngineLauncher>,
    prober: HealthProber,
    config: StartupConfig,
    bus: Arc<EventBus>,
}

impl StartupSequencer {
    pub fn new(
        descriptors: Arc<DescriptorTable>,
        launcher: Arc<dyn EngineLauncher>,
        prober: HealthProber,
        config: StartupConfig,
        bus: Arc<EventBus>,
    ) -> Self {
        Self { descriptors, launcher, prober, config, bus }
    }

    /// Sequence the whole fleet. Only configuration errors (or a critical
    /// readiness timeout under `abort_on_critical_timeout`) are returned as
    /// errors; per-engine failures land in the report.
    pub async fn run(&self, registry: &mut EngineRegistry) -> Result<StartupReport> {
        let started = Instant::now();

        // Cycles are rejected here, before anything is launched.
        let order: Vec<EngineDescriptor> = self.descriptors.startup_order()?.into_iter().cloned().collect();

        let mut report = StartupReport {
            order: order.iter().map(|e| e.name.clone()).collect(),
            ..Default::default()
        };
        info!(order = ?report.order, "Startup sequence resolved");

        let mut launched: HashSet<String> = HashSet::new();
        for engine in &order {
            if !launched.insert(engine.name.clone()) {
                continue;
            }
            match self.bring_up(engine, registry).await {
                Ok(()) => report.healthy.push(engine.name.clone()),
                Err(e @ FleetError::StartupAborted { .. }) => return Err(e),
                Err(e) => report.failed.push(StartupFailure { engine: engine.name.clone(), error: e.to_string() }),
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            healthy = report.healthy.len(),
            failed = report.failed.len(),
            duration_ms = report.duration_ms,
            "Startup sequence finished"
        );
        Ok(report)
    }

    async fn bring_up(&self, engine: &EngineDescriptor, registry: &mut EngineRegistry) -> Result<()> {
        if let Some(err) = self.unmet_dependency(engine, registry) {
            warn!(engine = %engine.name, "{}", err);
            let t = registry.mark_failed(&engine.name, FailureKind::DependencyNotReady, err.to_string());
            self.announce(t);
            return Err(err);
        }

        let t = registry.mark_starting(&engine.name);
        self.announce(t);

        if let Err(e) = self.launcher.launch(engine).await {
            let t = registry.mark_failed(&engine.name, FailureKind::LaunchFailed, e.to_string());
            self.announce(t);
            return Err(e);
        }

        if !engine.has_health_check() {
            let t = registry.apply_probe(&ProbeResult::assumed_healthy(&engine.name));
            self.announce(t);
            return Ok(());
        }

        let deadline = engine.readiness_timeout();
        match self.prober.wait_until_ready(engine, self.config.poll_interval(), deadline).await {
            Ok(ready) => {
                let t = registry.apply_probe(&ready);
                self.announce(t);
                Ok(())
            }
            Err(last) => {
                // Only a critical engine can stop the boot; everything else degrades.
                let err = if engine.priority.is_critical() && self.config.abort_on_critical_timeout {
                    FleetError::StartupAborted { engine: engine.name.clone(), timeout: deadline }
                } else {
                    FleetError::ProbeTimeout { engine: engine.name.clone(), timeout: deadline }
                };
                if engine.priority.is_critical() {
                    error!(engine = %engine.name, priority = %engine.priority, "blocking failure: {}", err);
                }
                let reason = format!("not ready within {:?}: {}", deadline, last.outcome.describe());
                let t = registry.mark_failed(&engine.name, FailureKind::ReadinessTimeout, reason);
                self.announce(t);
                Err(err)
            }
        }
    }

    /// A dependency is ready when HEALTHY. One without a health check only
    /// has to have been started.
    fn unmet_dependency(&self, engine: &EngineDescriptor, registry: &EngineRegistry) -> Option<FleetError> {
        engine.dependencies.iter().find_map(|dep| {
            let state = registry.state_of(dep).unwrap_or(EngineState::Unknown);
            let has_check = self.descriptors.get(dep).is_some_and(|d| d.has_health_check());
            let ready = match state {
                EngineState::Healthy => true,
                EngineState::Starting => !has_check,
                _ => false,
            };
            (!ready).then(|| FleetError::DependencyNotReady {
                engine: engine.name.clone(),
                dependency: dep.clone(),
                state,
            })
        })
    }

    fn announce(&self, transition: Option<Transition>) {
        if let Some(t) = transition {
            announce(&self.bus, &self.descriptors, &t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::Priority;
    use std::collections::HashMap;

    #[test]
    fn test_unmet_dependency_reports_state() {
        let table = Arc::new(DescriptorTable::new(vec![
            EngineDescriptor::new("feed", "http://x").with_health_path("/health"),
            EngineDescriptor::new("scanner", "http://y").with_dependencies(["feed"]).with_priority(Priority::High),
        ]));
        let registry = EngineRegistry::new(table.clone(), HashMap::new(), 8);
        let client: Arc<dyn crate::orchestrator::client::EngineClient> =
            Arc::new(crate::orchestrator::client::HttpEngineClient::new(std::time::Duration::from_millis(10)).unwrap());
        let seq = StartupSequencer::new(
            table.clone(),
            Arc::new(crate::orchestrator::launcher::ExternalLauncher),
            HealthProber::new(client, std::time::Duration::from_millis(10)),
            StartupConfig::default(),
            Arc::new(EventBus::new(8)),
        );

        let scanner = table.get("scanner").unwrap();
        let err = seq.unmet_dependency(scanner, &registry).unwrap();
        assert!(matches!(
            err,
            FleetError::DependencyNotReady { ref dependency, state: EngineState::Unknown, .. } if dependency == "feed"
        ));
        assert!(seq.unmet_dependency(table.get("feed").unwrap(), &registry).is_none());
    }
}
