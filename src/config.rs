//! Orchestrator Configuration
//!
//! Loaded from YAML at boot, then overridden by a handful of environment
//! variables. Every constant the control loop depends on (cadences, retry
//! ceilings, breaker threshold, scoring threshold) lives here.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::error::{FleetError, Result};
use crate::fleet::{DescriptorTable, Priority};
use crate::orchestrator::harvest::HarvestMode;

pub const DEFAULT_CONFIG_PATH: &str = "config/fleet.yaml";

/// A value per priority class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerPriority<T> {
    pub maximum: T,
    pub critical: T,
    pub high: T,
    pub medium: T,
    pub low: T,
}

impl<T: Copy> PerPriority<T> {
    pub fn get(&self, priority: Priority) -> T {
        match priority {
            Priority::Maximum => self.maximum,
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }

    fn values(&self) -> [T; 5] {
        [self.maximum, self.critical, self.high, self.medium, self.low]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:14000".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StartupConfig {
    pub poll_interval_ms: u64,
    /// Abort the whole boot when a CRITICAL/MAXIMUM engine misses its
    /// readiness deadline, instead of degrading.
    pub abort_on_critical_timeout: bool,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 500, abort_on_critical_timeout: false }
    }
}

impl StartupConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub tick_ms: u64,
    pub probe_timeout_ms: u64,
    /// Probe cadence per priority, in milliseconds.
    pub intervals: PerPriority<u64>,
    /// Consecutive failures before FAILED.
    pub failure_thresholds: PerPriority<u32>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            probe_timeout_ms: 3_000,
            intervals: PerPriority {
                maximum: 5_000,
                critical: 5_000,
                high: 10_000,
                medium: 15_000,
                low: 30_000,
            },
            failure_thresholds: PerPriority { maximum: 1, critical: 1, high: 2, medium: 3, low: 3 },
        }
    }
}

impl HealthConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn interval_for(&self, priority: Priority) -> Duration {
        Duration::from_millis(self.intervals.get(priority))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub delay_cap_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 2_000, delay_cap_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Emergency fires when more than this many critical engines are down.
    /// `None` derives it from the fleet: `min(2, critical_count - 1)`.
    pub emergency_threshold: Option<usize>,
    pub stop_timeout_ms: u64,
    /// Engines that receive protective-stop commands on emergency.
    pub protective_stop_engines: Vec<String>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { emergency_threshold: None, stop_timeout_ms: 2_000, protective_stop_engines: Vec::new() }
    }
}

impl BreakerConfig {
    pub fn threshold_for(&self, critical_count: usize) -> usize {
        self.emergency_threshold
            .unwrap_or_else(|| critical_count.saturating_sub(1).min(2))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub interval_ms: u64,
    pub scan_timeout_ms: u64,
    pub harvest_timeout_ms: u64,
    pub opportunity_threshold: f64,
    pub max_concurrent_opportunities: usize,
    pub harvest_concurrency: usize,
    pub harvest_mode: HarvestMode,
    /// Engine that receives AUTOMATIC harvest submissions.
    pub execution_engine: Option<String>,
    pub manual_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            scan_timeout_ms: 5_000,
            harvest_timeout_ms: 10_000,
            opportunity_threshold: 0.7,
            max_concurrent_opportunities: 10,
            harvest_concurrency: 4,
            harvest_mode: HarvestMode::Simulated,
            execution_engine: None,
            manual_queue_capacity: 256,
        }
    }
}

impl PipelineConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn harvest_timeout(&self) -> Duration {
        Duration::from_millis(self.harvest_timeout_ms)
    }
}

/// Per-engine guard on scan and execution calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallCircuitConfig {
    /// Consecutive call failures before the circuit opens.
    pub failure_threshold: u32,
    /// Half-open successes before it closes again.
    pub success_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for CallCircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, success_threshold: 3, recovery_timeout_ms: 60_000 }
    }
}

impl CallCircuitConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BroadcastConfig {
    pub heartbeat_ms: u64,
    pub channel_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { heartbeat_ms: 5_000, channel_capacity: 1024 }
    }
}

impl BroadcastConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FailureConfig {
    pub history_capacity: usize,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self { history_capacity: 500 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub call_circuit: CallCircuitConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub failures: FailureConfig,
    #[serde(default)]
    pub engines: DescriptorTable,
}

impl OrchestratorConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| FleetError::invalid(format!("malformed config: {}", e)))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| FleetError::invalid(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    /// `FLEET_BIND` and `FLEET_HARVEST_MODE` take precedence over the file.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(bind) = std::env::var("FLEET_BIND") {
            self.server.bind = bind;
        }
        if let Ok(mode) = std::env::var("FLEET_HARVEST_MODE") {
            self.pipeline.harvest_mode = mode.parse()?;
        }
        Ok(())
    }

    pub fn emergency_threshold(&self) -> usize {
        self.breaker.threshold_for(self.engines.critical_count())
    }

    pub fn failure_threshold_for(&self, name: &str) -> u32 {
        match self.engines.get(name) {
            Some(e) => e
                .failure_threshold
                .unwrap_or_else(|| self.health.failure_thresholds.get(e.priority)),
            None => 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.health.tick_ms == 0 || self.health.probe_timeout_ms == 0 {
            return Err(FleetError::invalid("health tick and probe timeout must be non-zero"));
        }
        if self.health.intervals.values().contains(&0) {
            return Err(FleetError::invalid("probe intervals must be non-zero"));
        }
        if self.health.failure_thresholds.values().contains(&0) {
            return Err(FleetError::invalid("failure thresholds must be at least 1"));
        }
        if self.startup.poll_interval_ms == 0 {
            return Err(FleetError::invalid("startup poll interval must be non-zero"));
        }
        if self.recovery.base_delay_ms > self.recovery.delay_cap_ms {
            return Err(FleetError::invalid("recovery base delay exceeds the delay cap"));
        }
        if self.breaker.stop_timeout_ms == 0 {
            return Err(FleetError::invalid("protective stop timeout must be non-zero"));
        }
        let p = &self.pipeline;
        if p.interval_ms == 0 || p.scan_timeout_ms == 0 || p.harvest_timeout_ms == 0 {
            return Err(FleetError::invalid("pipeline interval and timeouts must be non-zero"));
        }
        if !(0.0..=1.0).contains(&p.opportunity_threshold) {
            return Err(FleetError::invalid("opportunity threshold must be within [0, 1]"));
        }
        if p.max_concurrent_opportunities == 0 || p.harvest_concurrency == 0 || p.manual_queue_capacity == 0 {
            return Err(FleetError::invalid("pipeline capacities must be non-zero"));
        }
        let c = &self.call_circuit;
        if c.failure_threshold == 0 || c.success_threshold == 0 || c.recovery_timeout_ms == 0 {
            return Err(FleetError::invalid("call circuit thresholds and recovery timeout must be non-zero"));
        }
        if self.broadcast.heartbeat_ms == 0 || self.broadcast.channel_capacity == 0 {
            return Err(FleetError::invalid("broadcast heartbeat and capacity must be non-zero"));
        }
        if self.failures.history_capacity == 0 {
            return Err(FleetError::invalid("failure history capacity must be non-zero"));
        }

        self.engines.validate()?;

        for name in &self.breaker.protective_stop_engines {
            if self.engines.get(name).is_none() {
                return Err(FleetError::invalid(format!("protective stop target '{}' is not a declared engine", name)));
            }
        }
        if let Some(name) = &p.execution_engine {
            if self.engines.get(name).is_none() {
                return Err(FleetError::invalid(format!("execution engine '{}' is not a declared engine", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::EngineDescriptor;

    const SAMPLE: &str = r#"
health:
  probe_timeout_ms: 1500
recovery:
  max_retries: 5
breaker:
  protective_stop_engines: [executor]
pipeline:
  harvest_mode: manual
engines:
  - name: feed
    endpoint: http://127.0.0.1:14100
    priority: CRITICAL
    health_path: /health
  - name: executor
    endpoint: http://127.0.0.1:14101
    dependencies: [feed]
    priority: maximum
    stop_path: /api/emergency/stop
"#;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = OrchestratorConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.health.probe_timeout_ms, 1500);
        assert_eq!(cfg.health.tick_ms, 1000);
        assert_eq!(cfg.recovery.max_retries, 5);
        assert_eq!(cfg.recovery.delay_cap_ms, 60_000);
        assert_eq!(cfg.pipeline.harvest_mode, HarvestMode::Manual);
        assert_eq!(cfg.engines.len(), 2);
        assert!(cfg.engines.get("executor").unwrap().auto_restart);
        assert_eq!(cfg.call_circuit, CallCircuitConfig::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_zero_call_circuit_threshold_rejected() {
        let mut cfg = OrchestratorConfig::from_yaml_str(SAMPLE).unwrap();
        cfg.call_circuit.success_threshold = 0;
        assert!(matches!(cfg.validate(), Err(FleetError::InvalidConfig(_))));
    }

    #[test]
    fn test_derived_emergency_threshold() {
        let mut cfg = OrchestratorConfig::default();
        assert_eq!(cfg.emergency_threshold(), 0);

        cfg.engines = DescriptorTable::new(
            (0..5)
                .map(|i| EngineDescriptor::new(format!("e{}", i), "http://x").with_priority(Priority::Critical))
                .collect(),
        );
        assert_eq!(cfg.emergency_threshold(), 2);

        cfg.breaker.emergency_threshold = Some(4);
        assert_eq!(cfg.emergency_threshold(), 4);
    }

    #[test]
    fn test_unknown_stop_target_rejected() {
        let mut cfg = OrchestratorConfig::from_yaml_str(SAMPLE).unwrap();
        cfg.breaker.protective_stop_engines.push("ghost".into());
        assert!(cfg.validate().unwrap_err().is_fatal());
    }

    #[test]
    fn test_failure_threshold_override() {
        let mut cfg = OrchestratorConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.failure_threshold_for("feed"), 1);
        cfg.engines = DescriptorTable::new(vec![
            EngineDescriptor::new("slow", "http://x").with_priority(Priority::Low),
            EngineDescriptor::new("tuned", "http://x").with_priority(Priority::Low).with_failure_threshold(7),
        ]);
        assert_eq!(cfg.failure_threshold_for("slow"), 3);
        assert_eq!(cfg.failure_threshold_for("tuned"), 7);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.yaml");
        tokio::fs::write(&path, SAMPLE).await.unwrap();
        let cfg = OrchestratorConfig::load(&path).await.unwrap();
        assert_eq!(cfg.breaker.protective_stop_engines, vec!["executor".to_string()]);

        let missing = OrchestratorConfig::load(dir.path().join("nope.yaml")).await;
        assert!(matches!(missing, Err(FleetError::InvalidConfig(_))));
    }
}
