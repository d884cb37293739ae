//! Fleet Error Taxonomy
//!
//! Operational failures (probe, scan, harvest) are absorbed by the control
//! loop and retried on the next cadence. Configuration failures are fatal and
//! abort startup before any engine is launched.

use std::time::Duration;
use thiserror::Error;

use crate::fleet::EngineState;

pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Debug, Clone, Error)]
pub enum FleetError {
    // --- sequencing ---
    #[error("engine '{engine}' cannot start: dependency '{dependency}' is {state}")]
    DependencyNotReady {
        engine: String,
        dependency: String,
        state: EngineState,
    },

    #[error("startup aborted: critical engine '{engine}' not ready within {timeout:?}")]
    StartupAborted { engine: String, timeout: Duration },

    #[error("failed to launch engine '{engine}': {reason}")]
    LaunchFailed { engine: String, reason: String },

    // --- health ---
    #[error("probe of '{engine}' timed out after {timeout:?}")]
    ProbeTimeout { engine: String, timeout: Duration },

    #[error("probe of '{engine}' failed: {reason}")]
    ProbeError { engine: String, reason: String },

    // --- recovery ---
    #[error("engine '{engine}' exceeded retry ceiling ({max_retries})")]
    RetryCeilingExceeded { engine: String, max_retries: u32 },

    // --- breaker ---
    #[error("emergency escalation: {critical_down} critical engines down (threshold {threshold})")]
    EmergencyEscalation { critical_down: usize, threshold: usize },

    // --- pipeline ---
    #[error("scan of '{engine}' failed: {reason}")]
    ScanFailure { engine: String, reason: String },

    #[error("call circuit for '{engine}' is open; next attempt in {retry_in_ms}ms")]
    CircuitOpen { engine: String, retry_in_ms: u64 },

    #[error("harvest of opportunity {opportunity} failed: {reason}")]
    HarvestFailure { opportunity: String, reason: String },

    // --- transport ---
    #[error("transport error talking to '{engine}': {reason}")]
    Transport { engine: String, reason: String },

    // --- configuration (fatal) ---
    #[error("engine '{0}' is declared more than once")]
    DuplicateEngine(String),

    #[error("engine '{engine}' depends on unknown engine '{dependency}'")]
    UnknownDependency { engine: String, dependency: String },

    #[error("dependency cycle detected among engines: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FleetError {
    /// Configuration errors abort startup; everything else is absorbed by the
    /// control loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FleetError::DuplicateEngine(_)
                | FleetError::UnknownDependency { .. }
                | FleetError::DependencyCycle(_)
                | FleetError::InvalidConfig(_)
                | FleetError::StartupAborted { .. }
        )
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        FleetError::InvalidConfig(msg.into())
    }
}
