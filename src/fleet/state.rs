//! Engine runtime state and probe metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Unknown,
    Starting,
    Healthy,
    Degraded,
    Failed,
    Recovering,
    Dead,
}

impl EngineState {
    /// Counted as "down" by the circuit breaker.
    pub fn is_down(&self) -> bool {
        matches!(self, EngineState::Failed | EngineState::Dead)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Dead)
    }

    /// States in which the supervisor keeps issuing periodic probes.
    pub fn is_probed(&self) -> bool {
        matches!(self, EngineState::Starting | EngineState::Healthy | EngineState::Degraded)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Unknown => "UNKNOWN",
            EngineState::Starting => "STARTING",
            EngineState::Healthy => "HEALTHY",
            EngineState::Degraded => "DEGRADED",
            EngineState::Failed => "FAILED",
            EngineState::Recovering => "RECOVERING",
            EngineState::Dead => "DEAD",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthMetrics {
    pub total_probes: u64,
    pub successful_probes: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl HealthMetrics {
    pub fn record(&mut self, success: bool, at: DateTime<Utc>) {
        self.total_probes += 1;
        if success {
            self.successful_probes += 1;
            self.last_success = Some(at);
        } else {
            self.last_failure = Some(at);
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_probes == 0 {
            return 1.0;
        }
        self.successful_probes as f64 / self.total_probes as f64
    }
}

/// One per descriptor. Written only by the health supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineRuntimeState {
    pub state: EngineState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub retry_count: u32,
    pub last_transition_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub metrics: HealthMetrics,
}

impl EngineRuntimeState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: EngineState::Unknown,
            last_checked_at: None,
            last_latency_ms: None,
            consecutive_failures: 0,
            retry_count: 0,
            last_transition_at: now,
            last_error: None,
            metrics: HealthMetrics::default(),
        }
    }

    /// 0-100 score: success rate, penalised by consecutive failures (10 each,
    /// at most 50) and by a long silence since the last success (at most 20).
    pub fn health_score(&self, now: DateTime<Utc>) -> f64 {
        if self.metrics.total_probes == 0 {
            return match self.state {
                EngineState::Healthy => 100.0,
                _ => 0.0,
            };
        }

        let mut score = self.metrics.success_rate() * 100.0;
        score -= (self.consecutive_failures as f64 * 10.0).min(50.0);

        if let Some(last) = self.metrics.last_success {
            let silent_secs = (now - last).num_seconds() as f64;
            if silent_secs > 300.0 {
                score -= (silent_secs / 60.0).min(20.0);
            }
        }

        score.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_health_score_penalties() {
        let now = Utc::now();
        let mut rt = EngineRuntimeState::new(now);
        rt.state = EngineState::Healthy;
        assert_eq!(rt.health_score(now), 100.0);

        for _ in 0..4 {
            rt.metrics.record(true, now);
        }
        rt.metrics.record(false, now);
        rt.consecutive_failures = 1;
        // 80% success, one consecutive failure
        assert!((rt.health_score(now) - 70.0).abs() < 1e-9);

        // Ten minutes of silence costs ten points
        let later = now + Duration::minutes(10);
        assert!((rt.health_score(later) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_down_states() {
        assert!(EngineState::Failed.is_down());
        assert!(EngineState::Dead.is_down());
        assert!(!EngineState::Recovering.is_down());
        assert!(!EngineState::Degraded.is_down());
    }
}
