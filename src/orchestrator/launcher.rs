//! Engine Launcher
//!
//! Starts and restarts engines. Engines that declare a `command` are spawned
//! as child processes; everything else is assumed to be managed externally
//! and launching it is a no-op (readiness is still probed).

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{FleetError, Result};
use crate::fleet::EngineDescriptor;

#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, engine: &EngineDescriptor) -> Result<()>;

    /// Stop whatever is running for the engine, then launch it again.
    async fn restart(&self, engine: &EngineDescriptor) -> Result<()>;
}

/// Launcher for externally managed fleets.
pub struct ExternalLauncher;

#[async_trait]
impl EngineLauncher for ExternalLauncher {
    async fn launch(&self, _engine: &EngineDescriptor) -> Result<()> {
        Ok(())
    }

    async fn restart(&self, _engine: &EngineDescriptor) -> Result<()> {
        Ok(())
    }
}

/// Spawns engines as child processes and keeps their handles so they die
/// with the orchestrator.
#[derive(Default)]
pub struct ProcessLauncher {
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn(engine: &EngineDescriptor, argv: &[String]) -> Result<Child> {
        let (program, args) = argv.split_first().ok_or_else(|| FleetError::LaunchFailed {
            engine: engine.name.clone(),
            reason: "empty command".to_string(),
        })?;

        info!(engine = %engine.name, "Spawning engine via {} {:?}", program, args);
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FleetError::LaunchFailed { engine: engine.name.clone(), reason: e.to_string() })
    }

    pub async fn running(&self) -> Vec<String> {
        let mut children = self.children.lock().await;
        let mut alive = Vec::new();
        for (name, child) in children.iter_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                alive.push(name.clone());
            }
        }
        alive.sort();
        alive
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(&self, engine: &EngineDescriptor) -> Result<()> {
        let Some(argv) = &engine.command else {
            return Ok(());
        };

        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&engine.name) {
            if matches!(child.try_wait(), Ok(None)) {
                // Already running; launching twice is a no-op.
                return Ok(());
            }
        }
        let child = Self::spawn(engine, argv)?;
        children.insert(engine.name.clone(), child);
        Ok(())
    }

    async fn restart(&self, engine: &EngineDescriptor) -> Result<()> {
        let Some(argv) = &engine.command else {
            return Ok(());
        };

        let mut children = self.children.lock().await;
        if let Some(mut old) = children.remove(&engine.name) {
            if let Err(e) = old.kill().await {
                warn!(engine = %engine.name, "failed to stop previous process: {}", e);
            }
        }
        let child = Self::spawn(engine, argv)?;
        children.insert(engine.name.clone(), child);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engines_without_command_are_external() {
        let launcher = ProcessLauncher::new();
        let engine = EngineDescriptor::new("remote", "http://10.0.0.1:9000");
        launcher.launch(&engine).await.unwrap();
        launcher.restart(&engine).await.unwrap();
        assert!(launcher.running().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_failure() {
        let launcher = ProcessLauncher::new();
        let mut engine = EngineDescriptor::new("ghost", "http://127.0.0.1:1");
        engine.command = Some(vec!["/nonexistent/fleet-engine-binary".to_string()]);
        let err = launcher.launch(&engine).await.unwrap_err();
        assert!(matches!(err, FleetError::LaunchFailed { .. }));
    }
}
