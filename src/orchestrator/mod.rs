//! Orchestrator Module
//!
//! The supervisory control loop: startup sequencing, health supervision,
//! recovery, the emergency circuit breaker, the opportunity pipeline and the
//! state broadcaster.

pub mod breaker;
pub mod broadcaster;
pub mod circuit;
pub mod client;
pub mod event_bus;
pub mod failures;
pub mod harvest;
pub mod health;
pub mod launcher;
pub mod pipeline;
pub mod probe;
pub mod recovery;
pub mod scoring;
pub mod sequencer;
pub mod supervisor;

pub use breaker::{CircuitBreaker, EmergencyRecord, StopOutcome};
pub use broadcaster::{EngineView, StateBroadcaster, StateView, SystemSnapshot, SystemStatus};
pub use circuit::{CallCircuits, CircuitState, CircuitStatus};
pub use client::{EngineClient, HttpEngineClient, ProbeReport};
pub use event_bus::{EventBus, FleetEvent};
pub use failures::{uptime_percentage, FailureKind, FailureRecord, FailureReport};
pub use harvest::{
    Estimator, FixedEstimator, HarvestMode, HarvestReceipt, HarvestRouter, Harvester, ManualQueue, RandomEstimator,
};
pub use health::{EngineCounts, EngineDown, EngineRegistry, HealthSupervisor, RegistrySnapshot, SupervisorCommand};
pub use launcher::{EngineLauncher, ExternalLauncher, ProcessLauncher};
pub use pipeline::{ActiveSet, CycleReport, CycleStatus, HarvestOutcome, HarvestRecord, OpportunityPipeline};
pub use probe::{HealthProber, ProbeOutcome, ProbeResult};
pub use recovery::{RecoveryController, RecoveryDecision, RecoveryPolicy};
pub use sequencer::{StartupFailure, StartupReport, StartupSequencer};
pub use supervisor::{Orchestrator, OrchestratorHandle};
