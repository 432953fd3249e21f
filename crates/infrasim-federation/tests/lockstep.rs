//! Federated runs against a single engine, and the failure paths of the
//! synchronizer.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use infrasim_core::diagnostic::DiagnosticKind;
use infrasim_core::element::Element;
use infrasim_core::engine::SimError;
use infrasim_core::id::StateId;
use infrasim_core::location::Location;
use infrasim_core::optimizer::Optimizer;
use infrasim_core::resource::Resource;
use infrasim_core::scenario::ScenarioBuilder;
use infrasim_core::state::{EmptyState, State};
use infrasim_core::test_utils::*;
use infrasim_core::validation::compare_views;
use infrasim_federation::{FederationConfig, FederationError, OptimizerFactory, Synchronizer};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[test]
fn two_partitions_match_a_single_engine() {
    let scenario = west_east_scenario();
    let partitions = west_east_partitions(&scenario);
    let mut sync =
        Synchronizer::initialize(scenario.clone(), partitions, FederationConfig::default(), None).unwrap();
    let mut engine = engine_for(scenario);

    for _ in 0..20 {
        sync.advance().unwrap();
        engine.step().unwrap();
        let diffs = compare_views(&sync.elements().unwrap(), &engine.snapshot_all());
        assert!(diffs.is_empty(), "tick {}: {diffs:?}", engine.tick());
        assert_eq!(sync.state_hash(), engine.state_hash());
    }
    assert_eq!(sync.tick(), 20);
    assert!(sync.diagnostics().is_empty());
}

#[test]
fn one_partition_per_element_matches_too() {
    let scenario = west_east_scenario();
    let partitions: Vec<BTreeSet<_>> = scenario.elements.keys().map(|id| BTreeSet::from([id])).collect();
    let mut sync =
        Synchronizer::initialize(scenario.clone(), partitions, FederationConfig::default(), None).unwrap();
    let mut engine = engine_for(scenario);

    sync.run(8).unwrap();
    engine.run(8).unwrap();
    assert!(compare_views(&sync.elements().unwrap(), &engine.snapshot_all()).is_empty());
    assert_eq!(sync.state_hash(), engine.state_hash());
}

#[test]
fn migrants_cross_partitions_without_loss() {
    let scenario = migration_scenario();
    let east_town = scenario.find("east town").unwrap();
    let partitions = vec![
        scenario.elements.keys().filter(|&id| id != east_town).collect(),
        BTreeSet::from([east_town]),
    ];
    let mut sync =
        Synchronizer::initialize(scenario.clone(), partitions, FederationConfig::default(), None).unwrap();
    let mut engine = engine_for(scenario);

    for _ in 0..10 {
        sync.advance().unwrap();
        engine.step().unwrap();
        let views = sync.elements().unwrap();
        assert!(compare_views(&views, &engine.snapshot_all()).is_empty());
        let people: Decimal = views.iter().map(|v| v.stock.get(Resource::People)).sum();
        assert_eq!(people, dec!(15));
    }
    assert!(sync.diagnostics().is_empty());
}

#[test]
fn dispatch_reaches_wells_owned_by_another_partition() {
    let (mut b, west) = single_node_scenario();
    let first = b.add_element(water_source("first well", west, dec!(100)));
    let second = b.add_element(water_source("second well", west, dec!(100)));
    let town = b.add_element(water_consumer("town", west, dec!(10)));
    b.connect(first, town, Resource::Water).unwrap();
    b.connect(second, town, Resource::Water).unwrap();
    let scenario = b.build();
    let partitions = vec![BTreeSet::from([second, town]), BTreeSet::from([first])];
    let factory: OptimizerFactory =
        Arc::new(|| Box::new(ScriptedOptimizer::default()) as Box<dyn Optimizer>);
    let mut sync =
        Synchronizer::initialize(scenario.clone(), partitions, FederationConfig::default(), Some(factory))
            .unwrap();
    let mut engine = engine_for(scenario);
    engine.set_optimizer(Box::new(ScriptedOptimizer::default()));

    for _ in 0..4 {
        sync.advance().unwrap();
        engine.step().unwrap();
        assert!(compare_views(&sync.elements().unwrap(), &engine.snapshot_all()).is_empty());
        assert_eq!(sync.state_hash(), engine.state_hash());
    }
    assert!(sync.diagnostics().is_empty());
    let received = engine.element(town).unwrap().last_flows().received;
    assert_eq!(received.get(Resource::Water), dec!(10));
}

#[test]
fn lead_partition_reports_optimizer_fallback_once() {
    let scenario = west_east_scenario();
    let partitions = west_east_partitions(&scenario);
    let factory: OptimizerFactory =
        Arc::new(|| Box::new(ScriptedOptimizer::failing_on(&[1])) as Box<dyn Optimizer>);
    let mut sync =
        Synchronizer::initialize(scenario, partitions, FederationConfig::default(), Some(factory)).unwrap();
    sync.run(3).unwrap();
    assert_eq!(sync.diagnostics().count(DiagnosticKind::OptimizerFallback), 1);
}

#[test]
fn worker_initialization_error_is_escalated() {
    let (mut b, west) = single_node_scenario();
    b.add_element(
        Element::builder("dangling", Location::nodal(west)).state(
            StateId(0),
            State::Empty(EmptyState {
                activation_time: Decimal::ONE,
                next: StateId(9),
            }),
        ),
    );
    let scenario = b.build();
    let partitions = vec![scenario.elements.keys().collect()];
    let err = Synchronizer::initialize(scenario, partitions, FederationConfig::default(), None).unwrap_err();
    assert!(matches!(
        err,
        FederationError::Worker {
            partition: 0,
            source: SimError::InvalidState(_)
        }
    ));
}

#[test]
fn slow_worker_is_not_ready() {
    let scenario = west_east_scenario();
    let partitions = west_east_partitions(&scenario);
    let factory: OptimizerFactory = Arc::new(|| {
        thread::sleep(Duration::from_millis(300));
        Box::new(ScriptedOptimizer::default()) as Box<dyn Optimizer>
    });
    let config = FederationConfig {
        ready_timeout_ms: 10,
        ready_retries: 1,
        ..FederationConfig::default()
    };
    let err = Synchronizer::initialize(scenario, partitions, config, Some(factory)).unwrap_err();
    assert!(matches!(err, FederationError::WorkerNotReady { attempts: 2, .. }));
}

#[test]
fn mid_round_failure_aborts_the_run() {
    // The well sits at East but supplies a town at West.
    let mut b = ScenarioBuilder::new(Decimal::ZERO);
    let west = b.add_node("West");
    let east = b.add_node("East");
    let well = b.add_element(water_source("well", east, dec!(100)));
    let town = b.add_element(water_consumer("town", west, dec!(10)));
    b.connect(well, town, Resource::Water).unwrap();
    let partitions = vec![BTreeSet::from([town]), BTreeSet::from([well])];

    let mut sync = Synchronizer::initialize(b.build(), partitions, FederationConfig::default(), None).unwrap();
    let err = sync.advance().unwrap_err();
    assert!(matches!(
        err,
        FederationError::Worker {
            source: SimError::IncompatibleExchange(_),
            ..
        }
    ));
    assert!(matches!(sync.advance(), Err(FederationError::Aborted)));
    sync.shutdown();
}
