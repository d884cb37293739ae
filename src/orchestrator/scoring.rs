//! Opportunity scoring.
//!
//! ```text
//! score = clamp01((0.4·confidence + 0.25·profit − 0.15·risk
//!                  + typeBonus + priorityBonus) · coherence)
//! ```
//!
//! `coherence` is the fraction of engines currently HEALTHY, recomputed
//! every cycle. Profit potential is unbounded; only the final score is
//! clamped.

use std::cmp::Ordering;

use crate::fleet::{Opportunity, OpportunityType, Priority};

pub const CONFIDENCE_WEIGHT: f64 = 0.4;
pub const PROFIT_WEIGHT: f64 = 0.25;
pub const RISK_WEIGHT: f64 = 0.15;

pub fn type_bonus(kind: OpportunityType) -> f64 {
    match kind {
        OpportunityType::GoldenConfluence => 0.15,
        OpportunityType::ConsolidatedOpportunity => 0.10,
        OpportunityType::Arbitrage => 0.08,
        OpportunityType::Breakout => 0.05,
        OpportunityType::Momentum => 0.05,
        OpportunityType::MeanReversion => 0.03,
        OpportunityType::Other => 0.0,
    }
}

pub fn priority_bonus(priority: Priority) -> f64 {
    match priority {
        Priority::Maximum => 0.10,
        Priority::Critical => 0.08,
        Priority::High => 0.05,
        Priority::Medium => 0.02,
        Priority::Low => 0.0,
    }
}

/// Fraction of engines HEALTHY. An empty fleet has zero coherence.
pub fn coherence_factor(healthy: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (healthy as f64 / total as f64).clamp(0.0, 1.0)
}

pub fn crystallization_score(opp: &Opportunity, coherence: f64) -> f64 {
    let raw = CONFIDENCE_WEIGHT * opp.confidence + PROFIT_WEIGHT * opp.profit_potential
        - RISK_WEIGHT * opp.risk_score
        + type_bonus(opp.kind)
        + priority_bonus(opp.priority);
    let score = raw * coherence.clamp(0.0, 1.0);
    if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 }
}

/// Confidence floor. GOLDEN_CONFLUENCE sources pre-filter and bypass it.
pub fn passes_filter(opp: &Opportunity, threshold: f64) -> bool {
    opp.kind == OpportunityType::GoldenConfluence || opp.confidence >= threshold
}

/// Highest score first; ties go to the more confident candidate.
pub fn rank(opportunities: &mut [Opportunity]) {
    opportunities.sort_by(|a, b| {
        b.crystallization_score
            .total_cmp(&a.crystallization_score)
            .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal))
    });
}
