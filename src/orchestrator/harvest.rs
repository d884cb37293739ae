//! Harvest actions.
//!
//! The harvest step applies one of three actions to a crystallized
//! opportunity, selected at runtime by [`HarvestMode`]:
//! - AUTOMATIC submits it to the configured execution engine
//! - MANUAL parks it in a bounded queue for an operator
//! - SIMULATED estimates a realized profit through an [`Estimator`]

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{FleetError, Result};
use crate::fleet::{EngineDescriptor, Opportunity};
use crate::orchestrator::circuit::CallCircuits;
use crate::orchestrator::client::EngineClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarvestMode {
    #[serde(alias = "AUTOMATIC")]
    Automatic,
    #[serde(alias = "MANUAL")]
    Manual,
    #[serde(alias = "SIMULATED")]
    Simulated,
}

impl fmt::Display for HarvestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HarvestMode::Automatic => "AUTOMATIC",
            HarvestMode::Manual => "MANUAL",
            HarvestMode::Simulated => "SIMULATED",
        };
        f.write_str(s)
    }
}

impl FromStr for HarvestMode {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "automatic" => Ok(HarvestMode::Automatic),
            "manual" => Ok(HarvestMode::Manual),
            "simulated" => Ok(HarvestMode::Simulated),
            other => Err(FleetError::invalid(format!(
                "unknown harvest mode '{}' (expected automatic, manual or simulated)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestReceipt {
    pub detail: String,
    pub realized_profit: Option<f64>,
}

#[async_trait]
pub trait Harvester: Send + Sync {
    async fn harvest(&self, opportunity: &Opportunity) -> Result<HarvestReceipt>;
}

/// Source of the realized fraction used by simulated harvests.
pub trait Estimator: Send + Sync {
    /// A value in `[0.3, 1.0]`.
    fn realized_fraction(&self, opportunity: &Opportunity) -> f64;
}

pub const MIN_REALIZED_FRACTION: f64 = 0.3;
pub const MAX_REALIZED_FRACTION: f64 = 1.0;

pub struct RandomEstimator;

impl Estimator for RandomEstimator {
    fn realized_fraction(&self, _opportunity: &Opportunity) -> f64 {
        rand::thread_rng().gen_range(MIN_REALIZED_FRACTION..=MAX_REALIZED_FRACTION)
    }
}

/// Deterministic estimator.
pub struct FixedEstimator(pub f64);

impl Estimator for FixedEstimator {
    fn realized_fraction(&self, _opportunity: &Opportunity) -> f64 {
        self.0.clamp(MIN_REALIZED_FRACTION, MAX_REALIZED_FRACTION)
    }
}

pub struct SimulatedHarvester {
    estimator: Arc<dyn Estimator>,
}

impl SimulatedHarvester {
    pub fn new(estimator: Arc<dyn Estimator>) -> Self {
        Self { estimator }
    }
}

#[async_trait]
impl Harvester for SimulatedHarvester {
    async fn harvest(&self, opportunity: &Opportunity) -> Result<HarvestReceipt> {
        let fraction = self.estimator.realized_fraction(opportunity);
        let realized = opportunity.profit_potential * fraction;
        Ok(HarvestReceipt {
            detail: format!("simulated: {:.0}% of potential realized", fraction * 100.0),
            realized_profit: Some(realized),
        })
    }
}

/// Opportunities awaiting an operator decision. Oldest entries are dropped
/// once `capacity` is reached.
pub struct ManualQueue {
    capacity: usize,
    entries: Mutex<VecDeque<Opportunity>>,
}

impl ManualQueue {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: Mutex::new(VecDeque::new()) }
    }

    pub fn push(&self, opportunity: Opportunity) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() == self.capacity {
            if let Some(dropped) = entries.pop_front() {
                warn!(symbol = %dropped.symbol, "manual queue full; dropping oldest entry");
            }
        }
        entries.push_back(opportunity);
    }

    pub fn list(&self) -> Vec<Opportunity> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ManualHarvester {
    queue: Arc<ManualQueue>,
}

impl ManualHarvester {
    pub fn new(queue: Arc<ManualQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Harvester for ManualHarvester {
    async fn harvest(&self, opportunity: &Opportunity) -> Result<HarvestReceipt> {
        self.queue.push(opportunity.clone());
        Ok(HarvestReceipt {
            detail: format!("queued for operator ({} pending)", self.queue.len()),
            realized_profit: None,
        })
    }
}

/// Submits opportunities to the execution engine, through its call circuit.
pub struct ExecutionHarvester {
    client: Arc<dyn EngineClient>,
    engine: Option<EngineDescriptor>,
    circuits: Arc<CallCircuits>,
}

impl ExecutionHarvester {
    pub fn new(client: Arc<dyn EngineClient>, engine: Option<EngineDescriptor>, circuits: Arc<CallCircuits>) -> Self {
        Self { client, engine, circuits }
    }
}

#[async_trait]
impl Harvester for ExecutionHarvester {
    async fn harvest(&self, opportunity: &Opportunity) -> Result<HarvestReceipt> {
        let Some(engine) = &self.engine else {
            return Err(FleetError::HarvestFailure {
                opportunity: opportunity.id.map(|u| u.to_string()).unwrap_or_default(),
                reason: "no execution engine configured".to_string(),
            });
        };
        let ack = self.circuits.call(&engine.name, self.client.execute(engine, opportunity)).await?;
        Ok(HarvestReceipt { detail: ack, realized_profit: None })
    }
}

/// Holds the runtime mode and the harvester for each mode.
pub struct HarvestRouter {
    mode: RwLock<HarvestMode>,
    automatic: Arc<dyn Harvester>,
    manual: Arc<dyn Harvester>,
    simulated: Arc<dyn Harvester>,
}

impl HarvestRouter {
    pub fn new(
        mode: HarvestMode,
        automatic: Arc<dyn Harvester>,
        manual: Arc<dyn Harvester>,
        simulated: Arc<dyn Harvester>,
    ) -> Self {
        Self { mode: RwLock::new(mode), automatic, manual, simulated }
    }

    pub async fn mode(&self) -> HarvestMode {
        *self.mode.read().await
    }

    /// Returns the previous mode.
    pub async fn set_mode(&self, mode: HarvestMode) -> HarvestMode {
        let mut current = self.mode.write().await;
        let previous = std::mem::replace(&mut *current, mode);
        if previous != mode {
            info!(from = %previous, to = %mode, "Harvest mode changed");
        }
        previous
    }

    pub fn harvester_for(&self, mode: HarvestMode) -> Arc<dyn Harvester> {
        match mode {
            HarvestMode::Automatic => self.automatic.clone(),
            HarvestMode::Manual => self.manual.clone(),
            HarvestMode::Simulated => self.simulated.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{OpportunityType, Priority, ScannedCandidate};

    fn crystallized(symbol: &str, profit: f64) -> Opportunity {
        Opportunity::scanned(
            ScannedCandidate {
                symbol: symbol.into(),
                confidence: 0.9,
                profit_potential: profit,
                risk_score: 0.1,
                kind: OpportunityType::Arbitrage,
                priority: None,
            },
            "scanner",
            Priority::High,
        )
        .crystallize()
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("MANUAL".parse::<HarvestMode>().unwrap(), HarvestMode::Manual);
        assert_eq!(" simulated ".parse::<HarvestMode>().unwrap(), HarvestMode::Simulated);
        assert!("yolo".parse::<HarvestMode>().is_err());
        let m: HarvestMode = serde_json::from_str("\"AUTOMATIC\"").unwrap();
        assert_eq!(m, HarvestMode::Automatic);
        assert_eq!(serde_json::to_string(&HarvestMode::Manual).unwrap(), "\"manual\"");
    }

    #[tokio::test]
    async fn test_simulated_uses_estimator() {
        let h = SimulatedHarvester::new(Arc::new(FixedEstimator(0.5)));
        let receipt = h.harvest(&crystallized("BTC", 0.2)).await.unwrap();
        assert_eq!(receipt.realized_profit, Some(0.1));
    }

    #[test]
    fn test_random_estimator_in_range() {
        let o = crystallized("BTC", 1.0);
        for _ in 0..200 {
            let f = RandomEstimator.realized_fraction(&o);
            assert!((MIN_REALIZED_FRACTION..=MAX_REALIZED_FRACTION).contains(&f));
        }
    }

    #[tokio::test]
    async fn test_manual_queue_drops_oldest() {
        let queue = Arc::new(ManualQueue::new(2));
        let h = ManualHarvester::new(queue.clone());
        for s in ["A", "B", "C"] {
            h.harvest(&crystallized(s, 0.1)).await.unwrap();
        }
        let symbols: Vec<_> = queue.list().into_iter().map(|o| o.symbol).collect();
        assert_eq!(symbols, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_router_switches_mode() {
        let queue = Arc::new(ManualQueue::new(4));
        let sim: Arc<dyn Harvester> = Arc::new(SimulatedHarvester::new(Arc::new(FixedEstimator(1.0))));
        let router = HarvestRouter::new(HarvestMode::Simulated, sim.clone(), Arc::new(ManualHarvester::new(queue.clone())), sim);

        assert_eq!(router.set_mode(HarvestMode::Manual).await, HarvestMode::Simulated);
        let mode = router.mode().await;
        router.harvester_for(mode).harvest(&crystallized("X", 0.1)).await.unwrap();
        assert_eq!(queue.len(), 1);
    }
}
