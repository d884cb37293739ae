//! Fleet Event Bus
//!
//! Asynchronous pub/sub for state-change, escalation and heartbeat events.
//! Observers (the operator WebSocket, tests) subscribe; components publish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::fleet::{EngineState, Priority};
use crate::orchestrator::broadcaster::SystemSnapshot;
use crate::orchestrator::circuit::CircuitState;
use crate::orchestrator::harvest::HarvestMode;
use crate::orchestrator::pipeline::{CycleReport, HarvestRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum FleetEvent {
    /// Any engine state change
    EngineTransition {
        engine: String,
        priority: Priority,
        from: EngineState,
        to: EngineState,
        reason: String,
        at: DateTime<Utc>,
    },
    /// An engine entered FAILED
    EngineDown { engine: String, retry_count: u32, auto_restart: bool },
    /// A restart was scheduled with backoff
    RecoveryScheduled { engine: String, attempt: u32, delay_ms: u64 },
    /// Retry ceiling exceeded; the engine is DEAD
    PermanentFailure { engine: String, retries: u32, message: String },
    EmergencyActivated {
        critical_down: usize,
        threshold: usize,
        reason: String,
        manual: bool,
        at: DateTime<Utc>,
    },
    ProtectiveStop { engine: String, success: bool, error: Option<String> },
    /// A per-engine call circuit changed state
    CallCircuitChanged { engine: String, from: CircuitState, to: CircuitState },
    CycleCompleted(CycleReport),
    CycleSkipped { cycle: u64 },
    OpportunityHarvested(HarvestRecord),
    HarvestModeChanged { mode: HarvestMode },
    StateSnapshot(Box<SystemSnapshot>),
    Heartbeat(Box<SystemSnapshot>),
}

impl FleetEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FleetEvent::EngineTransition { .. } => "engine_transition",
            FleetEvent::EngineDown { .. } => "engine_down",
            FleetEvent::RecoveryScheduled { .. } => "recovery_scheduled",
            FleetEvent::PermanentFailure { .. } => "permanent_failure",
            FleetEvent::EmergencyActivated { .. } => "emergency_activated",
            FleetEvent::ProtectiveStop { .. } => "protective_stop",
            FleetEvent::CallCircuitChanged { .. } => "call_circuit_changed",
            FleetEvent::CycleCompleted(_) => "cycle_completed",
            FleetEvent::CycleSkipped { .. } => "cycle_skipped",
            FleetEvent::OpportunityHarvested(_) => "opportunity_harvested",
            FleetEvent::HarvestModeChanged { .. } => "harvest_mode_changed",
            FleetEvent::StateSnapshot(_) => "state_snapshot",
            FleetEvent::Heartbeat(_) => "heartbeat",
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all subscribers. Having no subscriber is not an error.
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
