//! Opportunity Pipeline
//!
//! One cycle runs scan -> filter -> score -> crystallize -> harvest. Cycles
//! never overlap: a cycle whose tick arrives while the previous one still
//! holds the working set is skipped, not queued.
//!
//! The active set is replaced wholesale each cycle. Anything not crystallized
//! in the current cycle is simply dropped.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::FleetError;
use crate::fleet::{EngineDescriptor, Opportunity};
use crate::orchestrator::breaker::CircuitBreaker;
use crate::orchestrator::circuit::CallCircuits;
use crate::orchestrator::client::EngineClient;
use crate::orchestrator::event_bus::{EventBus, FleetEvent};
use crate::orchestrator::harvest::{HarvestMode, HarvestRouter};
use crate::orchestrator::health::RegistrySnapshot;
use crate::orchestrator::scoring;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub harvest_mode: Option<HarvestMode>,
    pub engines_scanned: usize,
    pub scan_failures: usize,
    /// Scans skipped because the engine's call circuit was open.
    pub scans_short_circuited: usize,
    pub candidates: usize,
    pub filtered_out: usize,
    pub crystallized: usize,
    pub harvested: usize,
    pub harvest_failures: usize,
    pub coherence: f64,
}

impl CycleReport {
    fn new(cycle: u64, status: CycleStatus) -> Self {
        Self {
            cycle,
            status,
            started_at: Utc::now(),
            duration_ms: 0,
            harvest_mode: None,
            engines_scanned: 0,
            scan_failures: 0,
            scans_short_circuited: 0,
            candidates: 0,
            filtered_out: 0,
            crystallized: 0,
            harvested: 0,
            harvest_failures: 0,
            coherence: 0.0,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.status == CycleStatus::Skipped
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HarvestOutcome {
    Succeeded { detail: String, realized_profit: Option<f64> },
    Failed { reason: String },
    TimedOut { after_ms: u64 },
    /// Emergency mode: no remote call was made.
    Suppressed,
}

impl HarvestOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, HarvestOutcome::Failed { .. } | HarvestOutcome::TimedOut { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestRecord {
    pub opportunity_id: Uuid,
    pub symbol: String,
    pub source_engine: String,
    pub outcome: HarvestOutcome,
}

/// Published view of `activeOpportunities`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveSet {
    pub cycle: u64,
    pub opportunities: Vec<Opportunity>,
    pub last_report: Option<CycleReport>,
}

impl ActiveSet {
    pub fn len(&self) -> usize {
        self.opportunities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opportunities.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Opportunity> {
        self.opportunities.iter().find(|o| o.id == Some(id))
    }
}

#[derive(Default)]
struct PipelineState {
    active: BTreeMap<Uuid, Opportunity>,
    last_report: Option<CycleReport>,
}

pub struct OpportunityPipeline {
    config: PipelineConfig,
    client: Arc<dyn EngineClient>,
    circuits: Arc<CallCircuits>,
    router: Arc<HarvestRouter>,
    breaker: Arc<CircuitBreaker>,
    bus: Arc<EventBus>,
    registry_rx: watch::Receiver<Arc<RegistrySnapshot>>,
    state: Mutex<PipelineState>,
    active_tx: watch::Sender<Arc<ActiveSet>>,
    cycle_seq: AtomicU64,
}

impl OpportunityPipeline {
    pub fn new(
        config: PipelineConfig,
        client: Arc<dyn EngineClient>,
        circuits: Arc<CallCircuits>,
        router: Arc<HarvestRouter>,
        breaker: Arc<CircuitBreaker>,
        bus: Arc<EventBus>,
        registry_rx: watch::Receiver<Arc<RegistrySnapshot>>,
    ) -> Self {
        let (active_tx, _) = watch::channel(Arc::new(ActiveSet::default()));
        Self {
            config,
            client,
            circuits,
            router,
            breaker,
            bus,
            registry_rx,
            state: Mutex::new(PipelineState::default()),
            active_tx,
            cycle_seq: AtomicU64::new(0),
        }
    }

    pub fn subscribe_active(&self) -> watch::Receiver<Arc<ActiveSet>> {
        self.active_tx.subscribe()
    }

    pub fn active(&self) -> Arc<ActiveSet> {
        self.active_tx.borrow().clone()
    }

    pub fn router(&self) -> &Arc<HarvestRouter> {
        &self.router
    }

    /// Ticker loop. Each tick spawns a cycle so a slow cycle cannot hold the
    /// ticker; overlap is rejected inside [`run_cycle`](Self::run_cycle).
    pub async fn run(self: Arc<Self>) {
        let period = self.config.interval();
        info!(interval_ms = period.as_millis() as u64, "Opportunity pipeline online");

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let pipeline = self.clone();
            tokio::spawn(async move {
                pipeline.run_cycle().await;
            });
        }
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let cycle = self.cycle_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let Ok(mut state) = self.state.try_lock() else {
            warn!(cycle, "previous pipeline cycle still running; skipping");
            self.bus.publish(FleetEvent::CycleSkipped { cycle });
            return CycleReport::new(cycle, CycleStatus::Skipped);
        };

        let started = Instant::now();
        let mut report = CycleReport::new(cycle, CycleStatus::Completed);

        let registry = self.registry_rx.borrow().clone();
        let counts = registry.counts();
        report.coherence = scoring::coherence_factor(counts.healthy, registry.engines.len());

        // Scan
        let targets: Vec<EngineDescriptor> = registry
            .healthy_engines()
            .filter(|e| e.opportunity_path.is_some())
            .cloned()
            .collect();
        report.engines_scanned = targets.len();
        let scanned = self.scan(&targets, &mut report).await;
        report.candidates = scanned.len();

        // Filter + score
        let threshold = self.config.opportunity_threshold;
        let mut scored: Vec<Opportunity> = scanned
            .into_iter()
            .filter(|o| scoring::passes_filter(o, threshold))
            .map(|o| {
                let score = scoring::crystallization_score(&o, report.coherence);
                o.with_score(score)
            })
            .collect();
        report.filtered_out = report.candidates - scored.len();

        // Crystallize
        scoring::rank(&mut scored);
        scored.truncate(self.config.max_concurrent_opportunities);
        let crystallized: Vec<Opportunity> = scored.into_iter().map(Opportunity::crystallize).collect();
        report.crystallized = crystallized.len();

        state.active = crystallized
            .iter()
            .filter_map(|o| o.id.map(|id| (id, o.clone())))
            .collect();
        self.publish_active(cycle, &state);

        // Harvest
        let mode = self.router.mode().await;
        report.harvest_mode = Some(mode);
        let records = self.harvest(mode, &crystallized).await;
        for rec in records {
            if let Some(o) = state.active.remove(&rec.opportunity_id) {
                state.active.insert(rec.opportunity_id, o.harvested());
            }
            report.harvested += 1;
            if rec.outcome.is_failure() {
                report.harvest_failures += 1;
            }
            self.bus.publish(FleetEvent::OpportunityHarvested(rec));
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            cycle,
            coherence = report.coherence,
            scanned = report.engines_scanned,
            candidates = report.candidates,
            crystallized = report.crystallized,
            harvest_failures = report.harvest_failures,
            duration_ms = report.duration_ms,
            "Pipeline cycle complete"
        );

        state.last_report = Some(report.clone());
        self.publish_active(cycle, &state);
        self.bus.publish(FleetEvent::CycleCompleted(report.clone()));
        report
    }

    /// Scatter-gather over every target. A failing or slow engine contributes
    /// nothing this cycle; one whose call circuit is open is not called at all.
    async fn scan(&self, targets: &[EngineDescriptor], report: &mut CycleReport) -> Vec<Opportunity> {
        let scan_timeout = self.config.scan_timeout();
        let calls = targets.iter().map(|engine| async move {
            let guarded = self.circuits.call(&engine.name, self.client.list_opportunities(engine));
            (engine, timeout(scan_timeout, guarded).await)
        });

        let mut out = Vec::new();
        for (engine, result) in join_all(calls).await {
            match result {
                Ok(Ok(candidates)) => {
                    debug!(engine = %engine.name, count = candidates.len(), "scan ok");
                    out.extend(
                        candidates
                            .into_iter()
                            .map(|c| Opportunity::scanned(c, &engine.name, engine.priority)),
                    );
                }
                Ok(Err(FleetError::CircuitOpen { retry_in_ms, .. })) => {
                    report.scans_short_circuited += 1;
                    debug!(engine = %engine.name, retry_in_ms, "scan skipped: call circuit open");
                }
                Ok(Err(e)) => {
                    report.scan_failures += 1;
                    warn!(engine = %engine.name, "scan failed: {}", e);
                }
                Err(_) => {
                    report.scan_failures += 1;
                    warn!(engine = %engine.name, timeout_ms = scan_timeout.as_millis() as u64, "scan timed out");
                }
            }
        }
        out
    }

    async fn harvest(&self, mode: HarvestMode, batch: &[Opportunity]) -> Vec<HarvestRecord> {
        if self.breaker.trading_disabled() {
            warn!(count = batch.len(), "emergency mode: harvest suppressed");
            return batch
                .iter()
                .filter_map(|o| record(o, HarvestOutcome::Suppressed))
                .collect();
        }

        let harvester = self.router.harvester_for(mode);
        let harvest_timeout = self.config.harvest_timeout();

        stream::iter(batch.iter().cloned())
            .map(|o| {
                let harvester = harvester.clone();
                async move {
                    let outcome = match timeout(harvest_timeout, harvester.harvest(&o)).await {
                        Ok(Ok(receipt)) => HarvestOutcome::Succeeded {
                            detail: receipt.detail,
                            realized_profit: receipt.realized_profit,
                        },
                        Ok(Err(e)) => {
                            warn!(symbol = %o.symbol, source = %o.source_engine, "harvest failed: {}", e);
                            HarvestOutcome::Failed { reason: e.to_string() }
                        }
                        Err(_) => {
                            warn!(symbol = %o.symbol, source = %o.source_engine, "harvest timed out");
                            HarvestOutcome::TimedOut { after_ms: harvest_timeout.as_millis() as u64 }
                        }
                    };
                    record(&o, outcome)
                }
            })
            .buffer_unordered(self.config.harvest_concurrency.max(1))
            .filter_map(|r| async move { r })
            .collect()
            .await
    }

    fn publish_active(&self, cycle: u64, state: &PipelineState) {
        self.active_tx.send_replace(Arc::new(ActiveSet {
            cycle,
            opportunities: state.active.values().cloned().collect(),
            last_report: state.last_report.clone(),
        }));
    }
}

fn record(o: &Opportunity, outcome: HarvestOutcome) -> Option<HarvestRecord> {
    Some(HarvestRecord {
        opportunity_id: o.id?,
        symbol: o.symbol.clone(),
        source_engine: o.source_engine.clone(),
        outcome,
    })
}
