//! In-memory fleet used by the integration suites.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use fleet_orchestrator::config::OrchestratorConfig;
use fleet_orchestrator::error::{FleetError, Result};
use fleet_orchestrator::fleet::{
    DescriptorTable, EngineDescriptor, EngineState, Opportunity, OpportunityType, Priority, ScannedCandidate,
};
use fleet_orchestrator::orchestrator::{EngineClient, EngineLauncher, FleetEvent, ProbeReport};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Health {
    Up,
    Sick,
    Refused,
    Hang,
}

#[derive(Default)]
pub struct MockFleet {
    health: Mutex<HashMap<String, Health>>,
    listings: Mutex<HashMap<String, Vec<ScannedCandidate>>>,
    scans: Mutex<HashMap<String, Health>>,
    scan_delay: Mutex<Duration>,
    stop_reachable: Mutex<bool>,
    stop_hangs: Mutex<bool>,
    execute_fails: Mutex<bool>,
    pub scan_calls: Mutex<Vec<String>>,
    pub probes: Mutex<Vec<(String, Instant)>>,
    pub stops: Mutex<Vec<String>>,
    pub executed: Mutex<Vec<String>>,
    scans_in_flight: AtomicUsize,
    pub max_scans_in_flight: AtomicUsize,
}

impl MockFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_health(&self, engine: &str, health: Health) {
        self.health.lock().unwrap().insert(engine.to_string(), health);
    }

    pub fn health_of(&self, engine: &str) -> Health {
        self.health.lock().unwrap().get(engine).copied().unwrap_or(Health::Up)
    }

    pub fn set_listing(&self, engine: &str, candidates: Vec<ScannedCandidate>) {
        self.listings.lock().unwrap().insert(engine.to_string(), candidates);
    }

    /// Scan behaviour is independent of probe health.
    pub fn set_scan(&self, engine: &str, health: Health) {
        self.scans.lock().unwrap().insert(engine.to_string(), health);
    }

    pub fn set_scan_delay(&self, delay: Duration) {
        *self.scan_delay.lock().unwrap() = delay;
    }

    pub fn set_stop_reachable(&self, reachable: bool) {
        *self.stop_reachable.lock().unwrap() = reachable;
    }

    pub fn set_stop_hangs(&self, hangs: bool) {
        *self.stop_hangs.lock().unwrap() = hangs;
    }

    pub fn set_execute_fails(&self, fails: bool) {
        *self.execute_fails.lock().unwrap() = fails;
    }

    pub fn scan_count(&self, engine: &str) -> usize {
        self.scan_calls.lock().unwrap().iter().filter(|e| *e == engine).count()
    }

    pub fn probe_count(&self, engine: &str) -> usize {
        self.probes.lock().unwrap().iter().filter(|(e, _)| e == engine).count()
    }

    fn refused(engine: &EngineDescriptor) -> FleetError {
        FleetError::Transport { engine: engine.name.clone(), reason: "connection refused".into() }
    }
}

#[async_trait]
impl EngineClient for MockFleet {
    async fn probe(&self, engine: &EngineDescriptor) -> Result<ProbeReport> {
        self.probes.lock().unwrap().push((engine.name.clone(), Instant::now()));
        match self.health_of(&engine.name) {
            Health::Up => Ok(ProbeReport::healthy(r#"{"status":"healthy"}"#)),
            Health::Sick => Ok(ProbeReport::unhealthy(r#"{"status":"degraded"}"#)),
            Health::Refused => Err(Self::refused(engine)),
            Health::Hang => std::future::pending::<Result<ProbeReport>>().await,
        }
    }

    async fn list_opportunities(&self, engine: &EngineDescriptor) -> Result<Vec<ScannedCandidate>> {
        self.scan_calls.lock().unwrap().push(engine.name.clone());
        let now = self.scans_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_scans_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.scan_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let behaviour = self.scans.lock().unwrap().get(&engine.name).copied().unwrap_or(Health::Up);
        if behaviour == Health::Hang {
            std::future::pending::<()>().await;
        }
        let listing = self.listings.lock().unwrap().get(&engine.name).cloned().unwrap_or_default();
        let result = match behaviour {
            Health::Refused => Err(FleetError::ScanFailure { engine: engine.name.clone(), reason: "refused".into() }),
            _ => Ok(listing),
        };

        self.scans_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn protective_stop(&self, engine: &EngineDescriptor) -> Result<()> {
        self.stops.lock().unwrap().push(engine.name.clone());
        let hangs = *self.stop_hangs.lock().unwrap();
        if hangs {
            std::future::pending::<()>().await;
        }
        if *self.stop_reachable.lock().unwrap() {
            Ok(())
        } else {
            Err(Self::refused(engine))
        }
    }

    async fn execute(&self, engine: &EngineDescriptor, opportunity: &Opportunity) -> Result<String> {
        self.executed.lock().unwrap().push(opportunity.symbol.clone());
        if *self.execute_fails.lock().unwrap() {
            return Err(Self::refused(engine));
        }
        Ok("accepted".to_string())
    }
}

/// Records launches; optionally brings an engine back up on restart.
pub struct MockLauncher {
    fleet: Arc<MockFleet>,
    pub launched: Mutex<Vec<String>>,
    pub restarts: Mutex<Vec<String>>,
    heal_on_restart: Mutex<HashSet<String>>,
}

impl MockLauncher {
    pub fn new(fleet: Arc<MockFleet>) -> Arc<Self> {
        Arc::new(Self {
            fleet,
            launched: Mutex::new(Vec::new()),
            restarts: Mutex::new(Vec::new()),
            heal_on_restart: Mutex::new(HashSet::new()),
        })
    }

    pub fn heal_on_restart(&self, engine: &str) {
        self.heal_on_restart.lock().unwrap().insert(engine.to_string());
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }

    pub fn restart_count(&self, engine: &str) -> usize {
        self.restarts.lock().unwrap().iter().filter(|e| *e == engine).count()
    }
}

#[async_trait]
impl EngineLauncher for MockLauncher {
    async fn launch(&self, engine: &EngineDescriptor) -> Result<()> {
        self.launched.lock().unwrap().push(engine.name.clone());
        Ok(())
    }

    async fn restart(&self, engine: &EngineDescriptor) -> Result<()> {
        self.restarts.lock().unwrap().push(engine.name.clone());
        if self.heal_on_restart.lock().unwrap().contains(&engine.name) {
            self.fleet.set_health(&engine.name, Health::Up);
        }
        Ok(())
    }
}

pub fn engine(name: &str, priority: Priority) -> EngineDescriptor {
    EngineDescriptor::new(name, format!("http://{}.local", name))
        .with_priority(priority)
        .with_health_path("/health")
        .with_readiness_timeout(Duration::from_secs(1))
}

pub fn scanner(name: &str) -> EngineDescriptor {
    engine(name, Priority::High).with_opportunity_path("/api/opportunities")
}

pub fn candidate(symbol: &str, confidence: f64, kind: OpportunityType) -> ScannedCandidate {
    ScannedCandidate {
        symbol: symbol.to_string(),
        confidence,
        profit_potential: 0.2,
        risk_score: 0.1,
        kind,
        priority: None,
    }
}

/// Fast cadences so paused-clock tests need little virtual time.
pub fn config(engines: Vec<EngineDescriptor>) -> OrchestratorConfig {
    let mut cfg = OrchestratorConfig::default();
    cfg.engines = DescriptorTable::new(engines);
    cfg.startup.poll_interval_ms = 50;
    cfg.health.tick_ms = 100;
    cfg.health.probe_timeout_ms = 500;
    cfg.health.intervals.maximum = 200;
    cfg.health.intervals.critical = 200;
    cfg.health.intervals.high = 200;
    cfg.health.intervals.medium = 200;
    cfg.health.intervals.low = 200;
    cfg.recovery.base_delay_ms = 100;
    cfg.recovery.delay_cap_ms = 1_000;
    cfg.breaker.stop_timeout_ms = 200;
    // Pipeline cycles in tests are forced explicitly.
    cfg.pipeline.interval_ms = 3_600_000;
    cfg.broadcast.heartbeat_ms = 1_000;
    cfg
}

/// Everything published so far, without waiting.
pub fn drain(rx: &mut broadcast::Receiver<FleetEvent>) -> Vec<FleetEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => out.push(ev),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

/// `(from, to)` pairs for one engine, in publication order.
pub fn transitions(events: &[FleetEvent], name: &str) -> Vec<(EngineState, EngineState)> {
    events
        .iter()
        .filter_map(|ev| match ev {
            FleetEvent::EngineTransition { engine, from, to, .. } if engine == name => Some((*from, *to)),
            _ => None,
        })
        .collect()
}
