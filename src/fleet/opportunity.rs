//! Opportunity value objects.
//!
//! An opportunity is never mutated in place; each lifecycle promotion consumes
//! the previous value and yields its successor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::descriptor::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityType {
    /// Privileged: bypasses the confidence floor.
    GoldenConfluence,
    ConsolidatedOpportunity,
    Arbitrage,
    Breakout,
    Momentum,
    MeanReversion,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityStatus {
    Scanned,
    Crystallized,
    Harvested,
    Expired,
}

/// Scannable fields as returned by an engine's opportunity endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScannedCandidate {
    pub symbol: String,
    pub confidence: f64,
    #[serde(alias = "profitPotential")]
    pub profit_potential: f64,
    #[serde(alias = "riskScore")]
    pub risk_score: f64,
    #[serde(rename = "type")]
    pub kind: OpportunityType,
    /// Optional override; defaults to the source engine's priority.
    #[serde(default)]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Opportunity {
    /// Assigned at crystallization.
    pub id: Option<Uuid>,
    pub symbol: String,
    pub source_engine: String,
    #[serde(rename = "type")]
    pub kind: OpportunityType,
    pub confidence: f64,
    pub profit_potential: f64,
    pub risk_score: f64,
    pub priority: Priority,
    pub crystallization_score: f64,
    pub status: OpportunityStatus,
    pub created_at: DateTime<Utc>,
}

impl Opportunity {
    /// Build a SCANNED opportunity, clamping out-of-range engine input.
    pub fn scanned(candidate: ScannedCandidate, source_engine: &str, engine_priority: Priority) -> Self {
        Self {
            id: None,
            symbol: candidate.symbol,
            source_engine: source_engine.to_string(),
            kind: candidate.kind,
            confidence: sanitize(candidate.confidence).clamp(0.0, 1.0),
            profit_potential: sanitize(candidate.profit_potential).max(0.0),
            risk_score: sanitize(candidate.risk_score).clamp(0.0, 1.0),
            priority: candidate.priority.unwrap_or(engine_priority),
            crystallization_score: 0.0,
            status: OpportunityStatus::Scanned,
            created_at: Utc::now(),
        }
    }

    pub fn with_score(self, crystallization_score: f64) -> Self {
        Self { crystallization_score, ..self }
    }

    pub fn crystallize(self) -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            status: OpportunityStatus::Crystallized,
            ..self
        }
    }

    pub fn harvested(self) -> Self {
        Self {
            status: OpportunityStatus::Harvested,
            ..self
        }
    }
}

fn sanitize(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}
