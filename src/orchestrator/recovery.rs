//! Recovery Controller
//!
//! Consumes `EngineDown` events in order and decides whether to restart the
//! engine (exponential backoff, bounded retries) or give up. Decisions are
//! sent back to the health supervisor, which applies them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::RecoveryConfig;
use crate::fleet::DescriptorTable;
use crate::orchestrator::event_bus::{EventBus, FleetEvent};
use crate::orchestrator::health::{EngineDown, SupervisorCommand};
use crate::orchestrator::launcher::EngineLauncher;
use crate::orchestrator::probe::{HealthProber, ProbeOutcome, ProbeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub delay_cap: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Restart { attempt: u32, delay: Duration },
    GiveUp,
}

impl RecoveryPolicy {
    pub fn from_config(cfg: &RecoveryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            delay_cap: Duration::from_millis(cfg.delay_cap_ms),
        }
    }

    /// `min(base * 2^retry_count, cap)`, saturating.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.delay_cap)
            .min(self.delay_cap)
    }

    pub fn decide(&self, retry_count: u32) -> RecoveryDecision {
        if retry_count < self.max_retries {
            RecoveryDecision::Restart {
                attempt: retry_count + 1,
                delay: self.delay_for(retry_count),
            }
        } else {
            RecoveryDecision::GiveUp
        }
    }
}

pub struct RecoveryController {
    policy: RecoveryPolicy,
    descriptors: Arc<DescriptorTable>,
    launcher: Arc<dyn EngineLauncher>,
    prober: HealthProber,
    poll_interval: Duration,
    bus: Arc<EventBus>,
    down_rx: mpsc::UnboundedReceiver<EngineDown>,
    commands: mpsc::UnboundedSender<SupervisorCommand>,
}

impl RecoveryController {
    pub fn new(
        policy: RecoveryPolicy,
        descriptors: Arc<DescriptorTable>,
        launcher: Arc<dyn EngineLauncher>,
        prober: HealthProber,
        poll_interval: Duration,
        bus: Arc<EventBus>,
        down_rx: mpsc::UnboundedReceiver<EngineDown>,
        commands: mpsc::UnboundedSender<SupervisorCommand>,
    ) -> Self {
        Self { policy, descriptors, launcher, prober, poll_interval, bus, down_rx, commands }
    }

    pub async fn run(mut self) {
        info!(
            max_retries = self.policy.max_retries,
            base_delay_ms = self.policy.base_delay.as_millis() as u64,
            delay_cap_ms = self.policy.delay_cap.as_millis() as u64,
            "Recovery controller online"
        );
        while let Some(down) = self.down_rx.recv().await {
            self.handle(down);
        }
        warn!("Recovery controller stopped: event queue closed");
    }

    /// Returns whether a decision reached the supervisor.
    fn handle(&self, down: EngineDown) -> bool {
        if !down.auto_restart {
            warn!(engine = %down.engine, "engine FAILED without auto-restart; awaiting operator intervention");
            return false;
        }

        match self.policy.decide(down.retry_count) {
            RecoveryDecision::GiveUp => {
                let command = SupervisorCommand::GiveUp {
                    engine: down.engine.clone(),
                    max_retries: self.policy.max_retries,
                };
                if self.commands.send(command).is_err() {
                    warn!(engine = %down.engine, "health supervisor is gone; GiveUp not delivered");
                    return false;
                }
                true
            }
            RecoveryDecision::Restart { attempt, delay } => {
                info!(engine = %down.engine, attempt, delay_ms = delay.as_millis() as u64, "scheduling restart");
                if self
                    .commands
                    .send(SupervisorCommand::BeginRecovery { engine: down.engine.clone(), attempt })
                    .is_err()
                {
                    warn!(engine = %down.engine, attempt, "health supervisor is gone; restart not scheduled");
                    return false;
                }
                self.bus.publish(FleetEvent::RecoveryScheduled {
                    engine: down.engine.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                self.spawn_restart(down.engine, delay);
                true
            }
        }
    }

    fn spawn_restart(&self, name: String, delay: Duration) {
        let Some(engine) = self.descriptors.get(&name).cloned() else {
            error!(engine = %name, "restart requested for undeclared engine");
            return;
        };
        let launcher = self.launcher.clone();
        let prober = self.prober.clone();
        let commands = self.commands.clone();
        let poll = self.poll_interval;

        tokio::spawn(async move {
            sleep(delay).await;

            let result = match launcher.restart(&engine).await {
                Err(e) => {
                    error!(engine = %engine.name, "restart failed: {}", e);
                    ProbeResult::new(&engine.name, ProbeOutcome::Error { reason: e.to_string() })
                }
                Ok(()) if !engine.has_health_check() => ProbeResult::assumed_healthy(&engine.name),
                Ok(()) => match prober.wait_until_ready(&engine, poll, engine.readiness_timeout()).await {
                    Ok(ready) => ready,
                    Err(last) => last,
                },
            };

            if commands.send(SupervisorCommand::RecoveryFinished(result)).is_err() {
                warn!(engine = %engine.name, "health supervisor is gone; recovery result dropped");
            }
        });
    }
}
