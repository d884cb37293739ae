//! Engine Descriptor Table
//!
//! Static, immutable description of every engine in the fleet, loaded at boot.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;

use crate::error::{FleetError, Result};

/// Priority class of an engine. Declaration order is significance order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[serde(alias = "MAXIMUM")]
    Maximum,
    #[serde(alias = "CRITICAL")]
    Critical,
    #[serde(alias = "HIGH")]
    High,
    #[serde(alias = "MEDIUM")]
    Medium,
    #[serde(alias = "LOW")]
    Low,
}

impl Priority {
    /// Lower rank starts first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Maximum => 0,
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Medium => 3,
            Priority::Low => 4,
        }
    }

    /// Engines whose loss counts towards the emergency threshold.
    pub fn is_critical(&self) -> bool {
        matches!(self, Priority::Maximum | Priority::Critical)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Maximum => write!(f, "MAXIMUM"),
            Priority::Critical => write!(f, "CRITICAL"),
            Priority::High => write!(f, "HIGH"),
            Priority::Medium => write!(f, "MEDIUM"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

fn default_auto_restart() -> bool {
    true
}

fn default_readiness_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineDescriptor {
    pub name: String,
    /// Base URL, e.g. `http://127.0.0.1:14105`
    pub endpoint: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    /// `None` means no liveness check is possible; the engine is deemed
    /// healthy once started.
    #[serde(default)]
    pub health_path: Option<String>,
    /// Endpoint listing candidate opportunities. Engines without one do not
    /// take part in the pipeline.
    #[serde(default)]
    pub opportunity_path: Option<String>,
    /// Idempotent protective-stop endpoint.
    #[serde(default)]
    pub stop_path: Option<String>,
    /// Process to spawn. Absent for externally managed engines.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Consecutive failed probes before FAILED. Falls back to the
    /// per-priority default when absent.
    #[serde(default)]
    pub failure_threshold: Option<u32>,
}

impl EngineDescriptor {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            dependencies: Vec::new(),
            priority: Priority::default(),
            auto_restart: default_auto_restart(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
            health_path: None,
            opportunity_path: None,
            stop_path: None,
            command: None,
            failure_threshold: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = Some(path.into());
        self
    }

    pub fn with_opportunity_path(mut self, path: impl Into<String>) -> Self {
        self.opportunity_path = Some(path.into());
        self
    }

    pub fn with_stop_path(mut self, path: impl Into<String>) -> Self {
        self.stop_path = Some(path.into());
        self
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn has_health_check(&self) -> bool {
        self.health_path.is_some()
    }

    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// The full set of descriptors, in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct DescriptorTable {
    engines: Vec<EngineDescriptor>,
}

impl DescriptorTable {
    pub fn new(engines: Vec<EngineDescriptor>) -> Self {
        Self { engines }
    }

    pub fn engines(&self) -> &[EngineDescriptor] {
        &self.engines
    }

    pub fn get(&self, name: &str) -> Option<&EngineDescriptor> {
        self.engines.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn critical_count(&self) -> usize {
        self.engines.iter().filter(|e| e.priority.is_critical()).count()
    }

    /// Structural validation. Any error here aborts startup.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for engine in &self.engines {
            if engine.name.trim().is_empty() {
                return Err(FleetError::invalid("engine with empty name"));
            }
            if engine.endpoint.trim().is_empty() {
                return Err(FleetError::invalid(format!("engine '{}' has no endpoint", engine.name)));
            }
            if engine.readiness_timeout_ms == 0 {
                return Err(FleetError::invalid(format!(
                    "engine '{}' has a zero readiness timeout",
                    engine.name
                )));
            }
            if engine.failure_threshold == Some(0) {
                return Err(FleetError::invalid(format!(
                    "engine '{}' has a zero failure threshold",
                    engine.name
                )));
            }
            if let Some(cmd) = &engine.command {
                if cmd.is_empty() {
                    return Err(FleetError::invalid(format!("engine '{}' has an empty command", engine.name)));
                }
            }
            if !seen.insert(engine.name.as_str()) {
                return Err(FleetError::DuplicateEngine(engine.name.clone()));
            }
        }

        for engine in &self.engines {
            for dep in &engine.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(FleetError::UnknownDependency {
                        engine: engine.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.startup_order().map(|_| ())
    }

    /// Total order consistent with the dependency DAG. Among engines whose
    /// dependencies are all placed, the highest priority goes first, then
    /// declaration order.
    pub fn startup_order(&self) -> Result<Vec<&EngineDescriptor>> {
        let index: HashMap<&str, usize> = self
            .engines
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.as_str(), i))
            .collect();

        let n = self.engines.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, engine) in self.engines.iter().enumerate() {
            let unique: HashSet<&str> = engine.dependencies.iter().map(String::as_str).collect();
            for dep in unique {
                let &d = index.get(dep).ok_or_else(|| FleetError::UnknownDependency {
                    engine: engine.name.clone(),
                    dependency: dep.to_string(),
                })?;
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: BinaryHeap<Reverse<(u8, usize)>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| Reverse((self.engines[i].priority.rank(), i)))
            .collect();

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse((_, i))) = ready.pop() {
            order.push(&self.engines[i]);
            for &next in &dependents[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(Reverse((self.engines[next].priority.rank(), next)));
                }
            }
        }

        if order.len() < n {
            let stuck = indegree
                .iter()
                .enumerate()
                .filter(|(_, &deg)| deg > 0)
                .map(|(i, _)| self.engines[i].name.clone())
                .collect();
            return Err(FleetError::DependencyCycle(stuck));
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(order: &[&EngineDescriptor]) -> Vec<String> {
        order.iter().map(|e| e.name.clone()).collect()
    }

    #[test]
    fn test_priority_breaks_ties() {
        let table = DescriptorTable::new(vec![
            EngineDescriptor::new("low", "http://x").with_priority(Priority::Low),
            EngineDescriptor::new("crit", "http://x").with_priority(Priority::Critical),
            EngineDescriptor::new("high", "http://x").with_priority(Priority::High),
        ]);
        let order = table.startup_order().unwrap();
        assert_eq!(names(&order), vec!["crit", "high", "low"]);
    }

    #[test]
    fn test_dependencies_come_first() {
        let table = DescriptorTable::new(vec![
            EngineDescriptor::new("scanner", "http://x")
                .with_priority(Priority::Critical)
                .with_dependencies(["feed"]),
            EngineDescriptor::new("feed", "http://x").with_priority(Priority::Low),
        ]);
        let order = table.startup_order().unwrap();
        assert_eq!(names(&order), vec!["feed", "scanner"]);
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let table = DescriptorTable::new(vec![
            EngineDescriptor::new("loop", "http://x").with_dependencies(["loop"]),
        ]);
        assert!(matches!(table.validate(), Err(FleetError::DependencyCycle(_))));
    }

    #[test]
    fn test_duplicate_and_unknown() {
        let dup = DescriptorTable::new(vec![
            EngineDescriptor::new("a", "http://x"),
            EngineDescriptor::new("a", "http://y"),
        ]);
        assert!(matches!(dup.validate(), Err(FleetError::DuplicateEngine(_))));

        let unknown = DescriptorTable::new(vec![
            EngineDescriptor::new("a", "http://x").with_dependencies(["ghost"]),
        ]);
        assert!(matches!(unknown.validate(), Err(FleetError::UnknownDependency { .. })));
    }

    #[test]
    fn test_url_for_joins_slashes() {
        let e = EngineDescriptor::new("a", "http://host:1/");
        assert_eq!(e.url_for("/health"), "http://host:1/health");
        assert_eq!(e.url_for("health"), "http://host:1/health");
    }

    #[test]
    fn test_priority_parses_both_cases() {
        let p: Priority = serde_yaml::from_str("CRITICAL").unwrap();
        assert_eq!(p, Priority::Critical);
        let p: Priority = serde_yaml::from_str("low").unwrap();
        assert_eq!(p, Priority::Low);
    }
}
