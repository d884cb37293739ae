//! Startup sequencing against an in-memory fleet.

mod common;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;

use common::{config, engine, Health, MockFleet, MockLauncher};
use fleet_orchestrator::config::StartupConfig;
use fleet_orchestrator::fleet::{DescriptorTable, EngineDescriptor, EngineState, Priority};
use fleet_orchestrator::orchestrator::{EngineRegistry, EventBus, HealthProber, Orchestrator, StartupSequencer};
use fleet_orchestrator::FleetError;

const PRIORITIES: [Priority; 5] = [Priority::Maximum, Priority::Critical, Priority::High, Priority::Medium, Priority::Low];

fn random_fleet(rng: &mut StdRng, size: usize) -> Vec<EngineDescriptor> {
    let mut engines: Vec<EngineDescriptor> = (0..size)
        .map(|i| {
            let deps: Vec<String> = (0..i).filter(|_| rng.gen_bool(0.3)).map(|j| format!("e{}", j)).collect();
            EngineDescriptor::new(format!("e{}", i), "http://x")
                .with_priority(PRIORITIES[rng.gen_range(0..PRIORITIES.len())])
                .with_dependencies(deps)
        })
        .collect();
    engines.shuffle(rng);
    engines
}

#[tokio::test(start_paused = true)]
async fn test_random_dags_start_in_dependency_order() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..20 {
        let size = rng.gen_range(2..14);
        let fleet = MockFleet::new();
        let launcher = MockLauncher::new(fleet.clone());
        let cfg = config(random_fleet(&mut rng, size));
        let table = cfg.engines.clone();

        let (handle, report) = Orchestrator::new(cfg, fleet.clone(), launcher.clone())
            .unwrap()
            .start()
            .await
            .unwrap();
        handle.shutdown();

        assert!(report.is_clean());
        assert_eq!(report.order.len(), size);
        assert_eq!(launcher.launched(), report.order);

        let position: HashMap<&str, usize> =
            report.order.iter().enumerate().map(|(i, name)| (name.as_str(), i)).collect();
        for e in table.engines() {
            for dep in &e.dependencies {
                assert!(position[dep.as_str()] < position[e.name.as_str()], "{} started before {}", e.name, dep);
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_priority_then_declaration_breaks_ties() {
    let fleet = MockFleet::new();
    let launcher = MockLauncher::new(fleet.clone());
    let cfg = config(vec![
        engine("reporter", Priority::Low),
        engine("scanner-a", Priority::High),
        engine("feed", Priority::Maximum),
        engine("scanner-b", Priority::High),
        engine("risk", Priority::Critical),
    ]);

    let (handle, report) = Orchestrator::new(cfg, fleet, launcher).unwrap().start().await.unwrap();
    handle.shutdown();

    assert_eq!(report.order, vec!["feed", "risk", "scanner-a", "scanner-b", "reporter"]);
    assert_eq!(report.healthy, report.order);
}

#[tokio::test]
async fn test_cycle_rejected_before_any_launch() {
    let fleet = MockFleet::new();
    let launcher = MockLauncher::new(fleet.clone());
    let engines = vec![
        engine("a", Priority::High).with_dependencies(["c"]),
        engine("b", Priority::High).with_dependencies(["a"]),
        engine("c", Priority::High).with_dependencies(["b"]),
        engine("free", Priority::Maximum),
    ];

    let err = Orchestrator::new(config(engines.clone()), fleet.clone(), launcher.clone()).err().unwrap();
    assert!(matches!(err, FleetError::DependencyCycle(ref stuck) if stuck.len() == 3));
    assert!(err.is_fatal());

    // The sequencer rejects it on its own as well.
    let table = Arc::new(DescriptorTable::new(engines));
    let mut registry = EngineRegistry::new(table.clone(), HashMap::new(), 16);
    let sequencer = StartupSequencer::new(
        table,
        launcher.clone(),
        HealthProber::new(fleet, std::time::Duration::from_millis(100)),
        StartupConfig::default(),
        Arc::new(EventBus::new(16)),
    );
    let result = sequencer.run(&mut registry).await;
    assert!(matches!(result, Err(FleetError::DependencyCycle(_))));
    assert!(launcher.launched().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unready_dependency_fails_dependent_without_launch() {
    let fleet = MockFleet::new();
    fleet.set_health("feed", Health::Refused);
    let launcher = MockLauncher::new(fleet.clone());
    let cfg = config(vec![
        engine("feed", Priority::Maximum),
        engine("scanner", Priority::High).with_dependencies(["feed"]),
        engine("reporter", Priority::Low),
    ]);

    let (handle, report) = Orchestrator::new(cfg, fleet, launcher.clone()).unwrap().start().await.unwrap();

    let launched = launcher.launched();
    assert!(launched.contains(&"feed".to_string()));
    assert!(launched.contains(&"reporter".to_string()));
    assert!(!launched.contains(&"scanner".to_string()));

    assert_eq!(report.healthy, vec!["reporter"]);
    let failed: Vec<&str> = report.failed.iter().map(|f| f.engine.as_str()).collect();
    assert_eq!(failed, vec!["feed", "scanner"]);
    assert!(report.failed[1].error.contains("dependency 'feed'"));

    let registry = handle.registry();
    assert_eq!(registry.state_of("feed"), Some(EngineState::Failed));
    assert_eq!(registry.state_of("scanner"), Some(EngineState::Failed));
    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_engine_without_health_check_counts_as_ready() {
    let fleet = MockFleet::new();
    // Would never answer, but is never asked.
    fleet.set_health("bridge", Health::Hang);
    let launcher = MockLauncher::new(fleet.clone());
    let cfg = config(vec![
        EngineDescriptor::new("bridge", "http://bridge.local").with_priority(Priority::Critical),
        engine("scanner", Priority::High).with_dependencies(["bridge"]),
    ]);

    let (handle, report) = Orchestrator::new(cfg, fleet.clone(), launcher).unwrap().start().await.unwrap();
    handle.shutdown();

    assert!(report.is_clean());
    assert_eq!(report.healthy, vec!["bridge", "scanner"]);
    assert_eq!(fleet.probe_count("bridge"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_critical_timeout_aborts_when_configured() {
    let fleet = MockFleet::new();
    fleet.set_health("risk", Health::Sick);
    let launcher = MockLauncher::new(fleet.clone());
    let mut cfg = config(vec![
        engine("risk", Priority::Critical),
        engine("reporter", Priority::Low).with_dependencies(["risk"]),
    ]);
    cfg.startup.abort_on_critical_timeout = true;

    let err = Orchestrator::new(cfg, fleet, launcher.clone()).unwrap().start().await.err().unwrap();
    assert!(matches!(err, FleetError::StartupAborted { ref engine, .. } if engine == "risk"));
    assert_eq!(launcher.launched(), vec!["risk"]);
}

#[tokio::test(start_paused = true)]
async fn test_non_critical_timeout_degrades_under_abort_policy() {
    let fleet = MockFleet::new();
    fleet.set_health("reporter", Health::Sick);
    let launcher = MockLauncher::new(fleet.clone());
    let mut cfg = config(vec![engine("risk", Priority::Critical), engine("reporter", Priority::Low)]);
    cfg.startup.abort_on_critical_timeout = true;

    let (handle, report) = Orchestrator::new(cfg, fleet, launcher.clone()).unwrap().start().await.unwrap();
    handle.shutdown();

    assert_eq!(report.healthy, vec!["risk"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].engine, "reporter");
    assert!(report.failed[0].error.contains("timed out"), "{}", report.failed[0].error);
    assert_eq!(launcher.launched(), vec!["risk", "reporter"]);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_polls_until_healthy() {
    let fleet = MockFleet::new();
    fleet.set_health("feed", Health::Sick);
    let launcher = MockLauncher::new(fleet.clone());
    let cfg = config(vec![engine("feed", Priority::Maximum)]);

    let warmup = {
        let fleet = fleet.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            fleet.set_health("feed", Health::Up);
        })
    };

    let (handle, report) = Orchestrator::new(cfg, fleet.clone(), launcher).unwrap().start().await.unwrap();
    handle.shutdown();
    warmup.await.unwrap();

    assert!(report.is_clean());
    assert!(fleet.probe_count("feed") > 1);
    assert!(report.duration_ms >= 300);
}
