//! Health Supervisor
//!
//! Owns every engine's [`EngineRuntimeState`] and is the only writer of it.
//! Probes run on a fixed per-priority cadence; results drive the state
//! machine below, and each transition is logged and broadcast.
//!
//! ```text
//! UNKNOWN -> STARTING -> HEALTHY <-> DEGRADED
//!                 \          \         /
//!                  +--------> FAILED <+
//!                               |  ^
//!                               v  |
//!                           RECOVERING --> HEALTHY
//!                               |
//!                               v
//!                             DEAD (terminal)
//! ```
//!
//! Other components read state through [`RegistrySnapshot`]s published on a
//! watch channel, and ask for changes through [`SupervisorCommand`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::HealthConfig;
use crate::error::FleetError;
use crate::fleet::{DescriptorTable, EngineDescriptor, EngineRuntimeState, EngineState};
use crate::orchestrator::breaker::CircuitBreaker;
use crate::orchestrator::event_bus::{EventBus, FleetEvent};
use crate::orchestrator::failures::{FailureKind, FailureLog, FailureRecord};
use crate::orchestrator::probe::{HealthProber, ProbeOutcome, ProbeResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub engine: String,
    pub from: EngineState,
    pub to: EngineState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Raised on every transition into FAILED; consumed by the recovery controller.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineDown {
    pub engine: String,
    pub retry_count: u32,
    pub auto_restart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineEntry {
    pub descriptor: EngineDescriptor,
    pub runtime: EngineRuntimeState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineCounts {
    pub unknown: usize,
    pub starting: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
    pub recovering: usize,
    pub dead: usize,
}

impl EngineCounts {
    pub fn total(&self) -> usize {
        self.unknown + self.starting + self.healthy + self.degraded + self.failed + self.recovering + self.dead
    }
}

/// Read-only view of the registry at a point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistrySnapshot {
    pub engines: Vec<EngineEntry>,
    pub failures: Vec<FailureRecord>,
    pub taken_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> Option<&EngineEntry> {
        self.engines.iter().find(|e| e.descriptor.name == name)
    }

    pub fn state_of(&self, name: &str) -> Option<EngineState> {
        self.get(name).map(|e| e.runtime.state)
    }

    pub fn counts(&self) -> EngineCounts {
        let mut c = EngineCounts::default();
        for e in &self.engines {
            match e.runtime.state {
                EngineState::Unknown => c.unknown += 1,
                EngineState::Starting => c.starting += 1,
                EngineState::Healthy => c.healthy += 1,
                EngineState::Degraded => c.degraded += 1,
                EngineState::Failed => c.failed += 1,
                EngineState::Recovering => c.recovering += 1,
                EngineState::Dead => c.dead += 1,
            }
        }
        c
    }

    pub fn healthy_engines(&self) -> impl Iterator<Item = &EngineDescriptor> {
        self.engines
            .iter()
            .filter(|e| e.runtime.state == EngineState::Healthy)
            .map(|e| &e.descriptor)
    }

    pub fn critical_down(&self) -> usize {
        self.engines
            .iter()
            .filter(|e| e.descriptor.priority.is_critical() && e.runtime.state.is_down())
            .count()
    }
}

/// The engine state machine. Pure and synchronous; the async shell around
/// it is [`HealthSupervisor`].
#[derive(Debug, Clone)]
pub struct EngineRegistry {
    descriptors: Arc<DescriptorTable>,
    states: HashMap<String, EngineRuntimeState>,
    thresholds: HashMap<String, u32>,
    failures: FailureLog,
}

impl EngineRegistry {
    /// `thresholds` maps engine name to the consecutive-failure count that
    /// flips it to FAILED; missing entries default to 1.
    pub fn new(descriptors: Arc<DescriptorTable>, thresholds: HashMap<String, u32>, failure_capacity: usize) -> Self {
        let now = Utc::now();
        let states = descriptors
            .engines()
            .iter()
            .map(|e| (e.name.clone(), EngineRuntimeState::new(now)))
            .collect();
        Self {
            descriptors,
            states,
            thresholds,
            failures: FailureLog::new(failure_capacity),
        }
    }

    pub fn descriptors(&self) -> &Arc<DescriptorTable> {
        &self.descriptors
    }

    pub fn get(&self, name: &str) -> Option<&EngineRuntimeState> {
        self.states.get(name)
    }

    pub fn state_of(&self, name: &str) -> Option<EngineState> {
        self.states.get(name).map(|s| s.state)
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    fn threshold(&self, name: &str) -> u32 {
        self.thresholds.get(name).copied().unwrap_or(1).max(1)
    }

    fn transition(&mut self, name: &str, to: EngineState, reason: impl Into<String>) -> Option<Transition> {
        let rt = self.states.get_mut(name)?;
        let from = rt.state;
        if from == to {
            return None;
        }
        let at = Utc::now();
        rt.state = to;
        rt.last_transition_at = at;
        if to == EngineState::Healthy {
            rt.retry_count = 0;
            rt.consecutive_failures = 0;
            rt.last_error = None;
            self.failures.resolve(name, at);
        }
        Some(Transition { engine: name.to_string(), from, to, reason: reason.into(), at })
    }

    /// The sequencer (or a restart) is bringing the engine up.
    pub fn mark_starting(&mut self, name: &str) -> Option<Transition> {
        match self.state_of(name)? {
            EngineState::Unknown | EngineState::Failed => self.transition(name, EngineState::Starting, "launched"),
            _ => None,
        }
    }

    /// Force FAILED from any non-terminal state (launch failure, missed
    /// readiness deadline, unmet dependency).
    pub fn mark_failed(&mut self, name: &str, kind: FailureKind, reason: impl Into<String>) -> Option<Transition> {
        let reason = reason.into();
        let rt = self.states.get_mut(name)?;
        if rt.state.is_terminal() {
            return None;
        }
        rt.last_error = Some(reason.clone());
        self.failures.record(name, kind, reason.clone(), Utc::now());
        self.transition(name, EngineState::Failed, reason)
    }

    /// Apply a periodic probe result.
    pub fn apply_probe(&mut self, result: &ProbeResult) -> Option<Transition> {
        let threshold = self.threshold(&result.engine);
        let rt = self.states.get_mut(&result.engine)?;

        // Recovery owns FAILED/RECOVERING engines; DEAD is terminal.
        if !rt.state.is_probed() {
            debug!(engine = %result.engine, state = %rt.state, "ignoring probe for unprobed state");
            return None;
        }

        let healthy = result.outcome.is_healthy();
        rt.last_checked_at = Some(result.at);
        rt.metrics.record(healthy, result.at);
        if let Some(latency) = result.outcome.latency_ms() {
            rt.last_latency_ms = Some(latency);
        }

        if healthy {
            rt.consecutive_failures = 0;
            return self.transition(&result.engine, EngineState::Healthy, "probe succeeded");
        }

        rt.consecutive_failures += 1;
        let failures = rt.consecutive_failures;
        let from = rt.state;
        let reason = result.outcome.describe();
        rt.last_error = Some(reason.clone());

        let kind = match result.outcome {
            ProbeOutcome::Timeout { .. } => FailureKind::ProbeTimeout,
            ProbeOutcome::Unhealthy { .. } => FailureKind::Unhealthy,
            _ => FailureKind::ProbeError,
        };
        self.failures.record(&result.engine, kind, reason.clone(), result.at);

        let next = match from {
            EngineState::Starting => EngineState::Failed,
            _ if failures >= threshold => EngineState::Failed,
            _ => EngineState::Degraded,
        };
        self.transition(
            &result.engine,
            next,
            format!("{} ({} consecutive of {})", reason, failures, threshold),
        )
    }

    /// FAILED -> RECOVERING, consuming one retry.
    pub fn begin_recovery(&mut self, name: &str, attempt: u32) -> Option<Transition> {
        let rt = self.states.get_mut(name)?;
        if rt.state != EngineState::Failed {
            return None;
        }
        rt.retry_count += 1;
        let retry = rt.retry_count;
        self.transition(name, EngineState::Recovering, format!("restart attempt {} (retry {})", attempt, retry))
    }

    /// Retry ceiling exceeded: FAILED -> DEAD. Never left again.
    pub fn mark_dead(&mut self, name: &str, reason: impl Into<String>) -> Option<Transition> {
        let rt = self.states.get_mut(name)?;
        if rt.state != EngineState::Failed {
            return None;
        }
        rt.retry_count += 1;
        self.transition(name, EngineState::Dead, reason)
    }

    /// Outcome of the post-restart readiness probe.
    pub fn finish_recovery(&mut self, result: &ProbeResult) -> Option<Transition> {
        let rt = self.states.get_mut(&result.engine)?;
        if rt.state != EngineState::Recovering {
            return None;
        }
        let healthy = result.outcome.is_healthy();
        rt.last_checked_at = Some(result.at);
        rt.metrics.record(healthy, result.at);
        if let Some(latency) = result.outcome.latency_ms() {
            rt.last_latency_ms = Some(latency);
        }

        if healthy {
            self.transition(&result.engine, EngineState::Healthy, "recovered")
        } else {
            let reason = format!("restart did not recover: {}", result.outcome.describe());
            rt.last_error = Some(reason.clone());
            self.failures.record(&result.engine, FailureKind::RestartFailed, reason.clone(), result.at);
            self.transition(&result.engine, EngineState::Failed, reason)
        }
    }

    pub fn down_event(&self, name: &str) -> Option<EngineDown> {
        let rt = self.states.get(name)?;
        let desc = self.descriptors.get(name)?;
        Some(EngineDown {
            engine: name.to_string(),
            retry_count: rt.retry_count,
            auto_restart: desc.auto_restart,
        })
    }

    pub fn critical_down(&self) -> usize {
        self.descriptors
            .engines()
            .iter()
            .filter(|e| e.priority.is_critical())
            .filter(|e| self.states.get(&e.name).is_some_and(|rt| rt.state.is_down()))
            .count()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let engines = self
            .descriptors
            .engines()
            .iter()
            .filter_map(|d| {
                self.states.get(&d.name).map(|rt| EngineEntry { descriptor: d.clone(), runtime: rt.clone() })
            })
            .collect();
        RegistrySnapshot {
            engines,
            failures: self.failures.records().cloned().collect(),
            taken_at: Some(Utc::now()),
        }
    }
}

/// Log a transition and publish it on the bus.
pub(crate) fn announce(bus: &EventBus, descriptors: &DescriptorTable, t: &Transition) {
    let priority = descriptors.get(&t.engine).map(|d| d.priority).unwrap_or_default();

    match t.to {
        EngineState::Healthy => info!(engine = %t.engine, from = %t.from, "engine HEALTHY: {}", t.reason),
        EngineState::Degraded => warn!(engine = %t.engine, from = %t.from, "engine DEGRADED: {}", t.reason),
        EngineState::Failed | EngineState::Dead => {
            error!(engine = %t.engine, from = %t.from, to = %t.to, %priority, "engine down: {}", t.reason)
        }
        _ => info!(engine = %t.engine, from = %t.from, to = %t.to, "{}", t.reason),
    }

    bus.publish(FleetEvent::EngineTransition {
        engine: t.engine.clone(),
        priority,
        from: t.from,
        to: t.to,
        reason: t.reason.clone(),
        at: t.at,
    });
}

/// Requests other components make of the sole writer.
#[derive(Debug, Clone)]
pub enum SupervisorCommand {
    BeginRecovery { engine: String, attempt: u32 },
    GiveUp { engine: String, max_retries: u32 },
    RecoveryFinished(ProbeResult),
}

pub struct HealthSupervisor {
    registry: EngineRegistry,
    prober: HealthProber,
    config: HealthConfig,
    bus: Arc<EventBus>,
    breaker: Arc<CircuitBreaker>,
    down_tx: mpsc::UnboundedSender<EngineDown>,
    commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    snapshot_tx: watch::Sender<Arc<RegistrySnapshot>>,
    next_probe: HashMap<String, Instant>,
}

impl HealthSupervisor {
    pub fn new(
        registry: EngineRegistry,
        prober: HealthProber,
        config: HealthConfig,
        bus: Arc<EventBus>,
        breaker: Arc<CircuitBreaker>,
        down_tx: mpsc::UnboundedSender<EngineDown>,
        commands: mpsc::UnboundedReceiver<SupervisorCommand>,
        snapshot_tx: watch::Sender<Arc<RegistrySnapshot>>,
    ) -> Self {
        Self {
            registry,
            prober,
            config,
            bus,
            breaker,
            down_tx,
            commands,
            snapshot_tx,
            next_probe: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Main loop. Runs for the lifetime of the process.
    pub async fn run(mut self) {
        info!(engines = self.registry.descriptors().len(), "Health supervisor online");

        // Engines that failed during startup go straight to recovery.
        let failed: Vec<String> = self
            .registry
            .descriptors()
            .engines()
            .iter()
            .filter(|e| self.registry.state_of(&e.name) == Some(EngineState::Failed))
            .map(|e| e.name.clone())
            .collect();
        for name in failed {
            self.raise_down(&name);
        }
        self.after_change();

        let mut ticker = interval(self.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_pass().await,
                Some(cmd) = self.commands.recv() => self.handle_command(cmd),
            }
        }
    }

    /// Engines whose probe interval has elapsed.
    fn due_engines(&self, now: Instant) -> Vec<EngineDescriptor> {
        self.registry
            .descriptors()
            .engines()
            .iter()
            .filter(|e| self.registry.state_of(&e.name).is_some_and(|s| s.is_probed()))
            .filter(|e| self.next_probe.get(&e.name).map_or(true, |due| *due <= now))
            .cloned()
            .collect()
    }

    /// One supervisor pass: probe every due engine concurrently, apply the
    /// results, then re-evaluate the circuit breaker.
    pub async fn run_pass(&mut self) {
        let now = Instant::now();
        let due = self.due_engines(now);
        if !due.is_empty() {
            for e in &due {
                self.next_probe.insert(e.name.clone(), now + self.config.interval_for(e.priority));
            }

            let results = self.prober.probe_all(&due).await;
            for result in &results {
                if let Some(t) = self.registry.apply_probe(result) {
                    self.on_transition(t);
                }
            }
        }
        self.after_change();
    }

    pub fn handle_command(&mut self, cmd: SupervisorCommand) {
        let transition = match cmd {
            SupervisorCommand::BeginRecovery { engine, attempt } => self.registry.begin_recovery(&engine, attempt),
            SupervisorCommand::GiveUp { engine, max_retries } => {
                let err = FleetError::RetryCeilingExceeded { engine: engine.clone(), max_retries };
                let t = self.registry.mark_dead(&engine, err.to_string());
                if t.is_some() {
                    let retries = self.registry.get(&engine).map(|rt| rt.retry_count).unwrap_or_default();
                    error!(engine = %engine, retries, "{}", err);
                    self.bus.publish(FleetEvent::PermanentFailure {
                        engine: engine.clone(),
                        retries,
                        message: err.to_string(),
                    });
                }
                t
            }
            SupervisorCommand::RecoveryFinished(result) => {
                // Restarted engines are probed on the next pass.
                self.next_probe.remove(&result.engine);
                self.registry.finish_recovery(&result)
            }
        };
        if let Some(t) = transition {
            self.on_transition(t);
        }
        self.after_change();
    }

    fn on_transition(&mut self, t: Transition) {
        announce(&self.bus, self.registry.descriptors(), &t);
        if t.to == EngineState::Failed {
            self.raise_down(&t.engine);
        }
    }

    fn raise_down(&self, name: &str) {
        let Some(down) = self.registry.down_event(name) else {
            return;
        };
        self.bus.publish(FleetEvent::EngineDown {
            engine: down.engine.clone(),
            retry_count: down.retry_count,
            auto_restart: down.auto_restart,
        });
        if self.down_tx.send(down).is_err() {
            warn!(engine = %name, "recovery controller is gone; EngineDown not delivered");
        }
    }

    fn after_change(&mut self) {
        self.breaker.evaluate(self.registry.critical_down());
        self.snapshot_tx.send_replace(Arc::new(self.registry.snapshot()));
    }
}
