//! Fleet Orchestrator
//!
//! Supervises a fleet of independently deployed engines:
//! - dependency-ordered startup sequencing
//! - a per-engine health state machine with bounded, backed-off recovery
//! - an emergency circuit breaker over critical-engine failures
//! - a periodic scan -> score -> crystallize -> harvest opportunity pipeline
//! - state snapshots and events for operators

pub mod config;
pub mod error;
pub mod fleet;
pub mod orchestrator;
pub mod server;
pub mod utils;

// Re-exports for convenience
pub use config::OrchestratorConfig;
pub use error::{FleetError, Result};
pub use fleet::{DescriptorTable, EngineDescriptor, EngineState, Opportunity, Priority};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
