//! Supervisor
//!
//! Wires the control loop together: sequences startup, then spawns the
//! health supervisor, recovery controller, opportunity pipeline and state
//! broadcaster as independent tasks. The returned [`OrchestratorHandle`] is
//! the operator-facing command surface.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::fleet::{DescriptorTable, Opportunity};
use crate::orchestrator::breaker::CircuitBreaker;
use crate::orchestrator::broadcaster::{StateBroadcaster, StateView, SystemSnapshot};
use crate::orchestrator::circuit::CallCircuits;
use crate::orchestrator::client::EngineClient;
use crate::orchestrator::event_bus::{EventBus, FleetEvent};
use crate::orchestrator::failures::{failure_report, FailureReport};
use crate::orchestrator::harvest::{
    Estimator, ExecutionHarvester, HarvestMode, HarvestRouter, Harvester, ManualHarvester, ManualQueue,
    RandomEstimator, SimulatedHarvester,
};
use crate::orchestrator::health::{EngineRegistry, HealthSupervisor, RegistrySnapshot};
use crate::orchestrator::launcher::EngineLauncher;
use crate::orchestrator::pipeline::{CycleReport, OpportunityPipeline};
use crate::orchestrator::probe::HealthProber;
use crate::orchestrator::recovery::{RecoveryController, RecoveryPolicy};
use crate::orchestrator::sequencer::{StartupReport, StartupSequencer};

pub struct Orchestrator {
    config: OrchestratorConfig,
    client: Arc<dyn EngineClient>,
    launcher: Arc<dyn EngineLauncher>,
    estimator: Arc<dyn Estimator>,
    automatic: Option<Arc<dyn Harvester>>,
}

impl Orchestrator {
    /// Fails on any configuration error; nothing is launched in that case.
    pub fn new(
        config: OrchestratorConfig,
        client: Arc<dyn EngineClient>,
        launcher: Arc<dyn EngineLauncher>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            client,
            launcher,
            estimator: Arc::new(RandomEstimator),
            automatic: None,
        })
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn Estimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Replace the default AUTOMATIC action (submission to the execution engine).
    pub fn with_automatic_harvester(mut self, harvester: Arc<dyn Harvester>) -> Self {
        self.automatic = Some(harvester);
        self
    }

    pub async fn start(self) -> Result<(OrchestratorHandle, StartupReport)> {
        let Orchestrator { config, client, launcher, estimator, automatic } = self;

        let descriptors: Arc<DescriptorTable> = Arc::new(config.engines.clone());
        let bus = Arc::new(EventBus::new(config.broadcast.channel_capacity));
        let prober = HealthProber::new(client.clone(), config.health.probe_timeout());

        let thresholds: HashMap<String, u32> = descriptors
            .engines()
            .iter()
            .map(|e| (e.name.clone(), config.failure_threshold_for(&e.name)))
            .collect();
        let mut registry = EngineRegistry::new(descriptors.clone(), thresholds, config.failures.history_capacity);

        let sequencer = StartupSequencer::new(
            descriptors.clone(),
            launcher.clone(),
            prober.clone(),
            config.startup.clone(),
            bus.clone(),
        );
        let report = sequencer.run(&mut registry).await?;

        let breaker = Arc::new(CircuitBreaker::new(
            &config.breaker,
            config.emergency_threshold(),
            &descriptors,
            client.clone(),
            bus.clone(),
        ));

        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(registry.snapshot()));

        let supervisor = HealthSupervisor::new(
            registry,
            prober.clone(),
            config.health.clone(),
            bus.clone(),
            breaker.clone(),
            down_tx,
            cmd_rx,
            snapshot_tx,
        );
        let recovery = RecoveryController::new(
            RecoveryPolicy::from_config(&config.recovery),
            descriptors.clone(),
            launcher,
            prober,
            config.startup.poll_interval(),
            bus.clone(),
            down_rx,
            cmd_tx,
        );

        let circuits = Arc::new(CallCircuits::new(&config.call_circuit, bus.clone()));
        let queue = Arc::new(ManualQueue::new(config.pipeline.manual_queue_capacity));
        let execution_engine = config
            .pipeline
            .execution_engine
            .as_deref()
            .and_then(|name| descriptors.get(name).cloned());
        let automatic: Arc<dyn Harvester> = match automatic {
            Some(harvester) => harvester,
            None => Arc::new(ExecutionHarvester::new(client.clone(), execution_engine, circuits.clone())),
        };
        let router = Arc::new(HarvestRouter::new(
            config.pipeline.harvest_mode,
            automatic,
            Arc::new(ManualHarvester::new(queue.clone())),
            Arc::new(SimulatedHarvester::new(estimator)),
        ));

        let pipeline = Arc::new(OpportunityPipeline::new(
            config.pipeline.clone(),
            client,
            circuits.clone(),
            router.clone(),
            breaker.clone(),
            bus.clone(),
            snapshot_rx.clone(),
        ));

        let view = StateView::new(
            snapshot_rx,
            pipeline.subscribe_active(),
            breaker.clone(),
            router.clone(),
            circuits,
        );
        let broadcaster = StateBroadcaster::new(view.clone(), bus.clone(), config.broadcast.heartbeat());

        let tasks = vec![
            tokio::spawn(supervisor.run()).abort_handle(),
            tokio::spawn(recovery.run()).abort_handle(),
            tokio::spawn(pipeline.clone().run()).abort_handle(),
            tokio::spawn(broadcaster.run()).abort_handle(),
        ];

        info!(
            engines = descriptors.len(),
            healthy = report.healthy.len(),
            failed = report.failed.len(),
            emergency_threshold = breaker.threshold(),
            harvest_mode = %config.pipeline.harvest_mode,
            "Fleet orchestrator running"
        );

        let handle = OrchestratorHandle {
            view,
            pipeline,
            breaker,
            router,
            bus,
            queue,
            tasks: Arc::new(tasks),
        };
        Ok((handle, report))
    }
}

/// Cloneable command surface over a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    view: StateView,
    pipeline: Arc<OpportunityPipeline>,
    breaker: Arc<CircuitBreaker>,
    router: Arc<HarvestRouter>,
    bus: Arc<EventBus>,
    queue: Arc<ManualQueue>,
    tasks: Arc<Vec<AbortHandle>>,
}

impl OrchestratorHandle {
    pub async fn snapshot(&self) -> SystemSnapshot {
        self.view.snapshot().await
    }

    pub fn registry(&self) -> Arc<RegistrySnapshot> {
        self.view.registry()
    }

    /// Run one pipeline cycle now. A cycle already in flight makes this one
    /// a skip.
    pub async fn force_cycle(&self) -> CycleReport {
        info!("Operator forced a pipeline cycle");
        self.pipeline.run_cycle().await
    }

    pub async fn harvest_mode(&self) -> HarvestMode {
        self.router.mode().await
    }

    /// Returns the previous mode.
    pub async fn set_harvest_mode(&self, mode: HarvestMode) -> HarvestMode {
        let previous = self.router.set_mode(mode).await;
        if previous != mode {
            self.bus.publish(FleetEvent::HarvestModeChanged { mode });
        }
        previous
    }

    /// Returns false when emergency mode was already active.
    pub fn trigger_emergency(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let critical_down = self.view.registry().critical_down();
        warn!(critical_down, "Operator triggered emergency: {}", reason);
        self.breaker.trigger_manual(reason, critical_down).is_some()
    }

    pub fn is_emergency(&self) -> bool {
        self.breaker.is_emergency()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.bus.subscribe()
    }

    pub fn failure_report(&self, hours: i64) -> FailureReport {
        let registry = self.view.registry();
        failure_report(&registry.failures, hours, Utc::now())
    }

    pub fn manual_queue(&self) -> Vec<Opportunity> {
        self.queue.list()
    }

    /// Stop every background loop. In-flight probes and harvests are abandoned.
    pub fn shutdown(&self) {
        info!("Shutting down orchestrator loops");
        for task in self.tasks.iter() {
            task.abort();
        }
    }
}
