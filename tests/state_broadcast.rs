//! Snapshots go out on material change and on the heartbeat, nothing more.

mod common;

use std::time::Duration;
use tokio::time::sleep;

use common::{config, drain, engine, Health, MockFleet, MockLauncher};
use fleet_orchestrator::fleet::{EngineState, Priority};
use fleet_orchestrator::orchestrator::{FleetEvent, Orchestrator, SystemSnapshot, SystemStatus};

fn snapshots(events: &[FleetEvent]) -> Vec<&SystemSnapshot> {
    events
        .iter()
        .filter_map(|ev| match ev {
            FleetEvent::StateSnapshot(s) => Some(s.as_ref()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_steady_fleet_only_heartbeats() {
    let fleet = MockFleet::new();
    let launcher = MockLauncher::new(fleet.clone());
    let cfg = config(vec![engine("feed", Priority::Maximum), engine("scanner", Priority::High)]);

    let (handle, _) = Orchestrator::new(cfg, fleet, launcher).unwrap().start().await.unwrap();
    let mut rx = handle.subscribe();
    sleep(Duration::from_millis(3_500)).await;
    let events = drain(&mut rx);
    handle.shutdown();

    assert!(snapshots(&events).is_empty());
    let heartbeats = events.iter().filter(|ev| ev.kind() == "heartbeat").count();
    assert!((3..=4).contains(&heartbeats), "{} heartbeats", heartbeats);
}

#[tokio::test(start_paused = true)]
async fn test_state_change_pushes_snapshot() {
    let fleet = MockFleet::new();
    let launcher = MockLauncher::new(fleet.clone());
    let cfg = config(vec![
        engine("feed", Priority::Maximum),
        engine("reporter", Priority::Low).with_failure_threshold(1).with_auto_restart(false),
    ]);

    let (handle, _) = Orchestrator::new(cfg, fleet.clone(), launcher).unwrap().start().await.unwrap();
    // Let every loop come up before anything changes.
    sleep(Duration::from_millis(50)).await;
    let mut rx = handle.subscribe();
    fleet.set_health("reporter", Health::Refused);
    sleep(Duration::from_millis(500)).await;
    let events = drain(&mut rx);
    handle.shutdown();

    let pushed = snapshots(&events);
    assert_eq!(pushed.len(), 1);
    let snap = pushed[0];
    assert_eq!(snap.counts.failed, 1);
    assert_eq!(snap.coherence, 0.5);
    // One of two engines down is not yet a majority.
    assert_eq!(snap.overall_status, SystemStatus::Degraded);
    assert!(snap.recent_failures >= 1);
    let reporter = snap.engines.iter().find(|e| e.name == "reporter").unwrap();
    assert_eq!(reporter.runtime.state, EngineState::Failed);
    assert!(reporter.runtime.last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_completed_cycle_pushes_snapshot() {
    let fleet = MockFleet::new();
    let launcher = MockLauncher::new(fleet.clone());
    let cfg = config(vec![engine("feed", Priority::Maximum)]);

    let (handle, _) = Orchestrator::new(cfg, fleet, launcher).unwrap().start().await.unwrap();
    let mut rx = handle.subscribe();
    let report = handle.force_cycle().await;
    sleep(Duration::from_millis(10)).await;
    let events = drain(&mut rx);
    handle.shutdown();

    let pushed = snapshots(&events);
    assert!(!pushed.is_empty());
    assert_eq!(pushed.last().unwrap().last_cycle.as_ref().unwrap().cycle, report.cycle);
}
