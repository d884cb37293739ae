//! Engine Call Circuits
//!
//! One circuit per engine guards the pipeline's outbound calls (scans and
//! execution submissions). After `failure_threshold` consecutive failures the
//! circuit opens and calls fail fast without touching the engine. Once
//! `recovery_timeout` has passed since the last failure the next call is let
//! through half-open; `success_threshold` successes close it again, a single
//! failure re-opens it.
//!
//! Unrelated to [`CircuitBreaker`](crate::orchestrator::CircuitBreaker), which
//! escalates the whole fleet into emergency mode.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CallCircuitConfig;
use crate::error::{FleetError, Result};
use crate::orchestrator::event_bus::{EventBus, FleetEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

#[derive(Debug, Clone)]
struct CallCircuit {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

impl Default for CallCircuit {
    fn default() -> Self {
        Self { state: CircuitState::Closed, failures: 0, successes: 0, last_failure: None }
    }
}

impl CallCircuit {
    fn status(&self) -> CircuitStatus {
        CircuitStatus { state: self.state, failure_count: self.failures, success_count: self.successes }
    }
}

pub struct CallCircuits {
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    circuits: Mutex<HashMap<String, CallCircuit>>,
    bus: Arc<EventBus>,
}

impl CallCircuits {
    pub fn new(config: &CallCircuitConfig, bus: Arc<EventBus>) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            circuits: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Run `call` against `engine` through its circuit. A call dropped before
    /// it resolves (an outer timeout) counts as a failure.
    pub async fn call<T, F>(&self, engine: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.admit(engine)?;
        let mut pending = Pending { circuits: self, engine, settled: false };
        let result = call.await;
        pending.settled = true;
        self.settle(engine, result.is_ok());
        result
    }

    pub fn state_of(&self, engine: &str) -> CircuitState {
        self.lock().get(engine).map(|c| c.state).unwrap_or(CircuitState::Closed)
    }

    /// Every circuit that has seen traffic.
    pub fn statuses(&self) -> BTreeMap<String, CircuitStatus> {
        self.lock().iter().map(|(name, c)| (name.clone(), c.status())).collect()
    }

    fn admit(&self, engine: &str) -> Result<()> {
        let mut circuits = self.lock();
        let circuit = circuits.entry(engine.to_string()).or_default();
        if circuit.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = circuit.last_failure.map(|at| at.elapsed()).unwrap_or(self.recovery_timeout);
        if elapsed >= self.recovery_timeout {
            circuit.state = CircuitState::HalfOpen;
            circuit.successes = 0;
            drop(circuits);
            self.announce(engine, CircuitState::Open, CircuitState::HalfOpen);
            return Ok(());
        }

        Err(FleetError::CircuitOpen {
            engine: engine.to_string(),
            retry_in_ms: (self.recovery_timeout - elapsed).as_millis() as u64,
        })
    }

    fn settle(&self, engine: &str, ok: bool) {
        let mut circuits = self.lock();
        let circuit = circuits.entry(engine.to_string()).or_default();
        let from = circuit.state;

        if ok {
            match circuit.state {
                CircuitState::HalfOpen => {
                    circuit.successes += 1;
                    if circuit.successes >= self.success_threshold {
                        *circuit = CallCircuit::default();
                    }
                }
                _ => circuit.failures = 0,
            }
        } else {
            circuit.failures += 1;
            circuit.last_failure = Some(Instant::now());
            if circuit.state == CircuitState::HalfOpen || circuit.failures >= self.failure_threshold {
                circuit.state = CircuitState::Open;
            }
        }

        let to = circuit.state;
        let failures = circuit.failures;
        drop(circuits);
        if from != to {
            if to == CircuitState::Open {
                warn!(engine, failures, "call circuit opened");
            }
            self.announce(engine, from, to);
        }
    }

    fn announce(&self, engine: &str, from: CircuitState, to: CircuitState) {
        info!(engine, %from, %to, "call circuit transition");
        self.bus.publish(FleetEvent::CallCircuitChanged { engine: engine.to_string(), from, to });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CallCircuit>> {
        self.circuits.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Settles an abandoned call as a failure.
struct Pending<'a> {
    circuits: &'a CallCircuits,
    engine: &'a str,
    settled: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.circuits.settle(self.engine, false);
        }
    }
}
