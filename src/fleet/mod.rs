//! Fleet Data Model
//!
//! Descriptors, runtime state and opportunity value objects shared by the
//! orchestrator components.

pub mod descriptor;
pub mod opportunity;
pub mod state;

pub use descriptor::{DescriptorTable, EngineDescriptor, Priority};
pub use opportunity::{Opportunity, OpportunityStatus, OpportunityType, ScannedCandidate};
pub use state::{EngineRuntimeState, EngineState, HealthMetrics};
