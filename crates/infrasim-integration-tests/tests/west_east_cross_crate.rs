//! Integration test: West/East across every crate.
//!
//! The same two-node scenario is run on a plain engine, on an engine driven
//! by the min-cost-flow optimizer, and on a two-partition federation. All
//! three must agree, and the closed scenario must stay free of diagnostics.

use infrasim_core::config::SimConfig;
use infrasim_core::diagnostic::DiagnosticKind;
use infrasim_core::optimizer::Optimizer;
use infrasim_core::resource::Resource;
use infrasim_core::state::LifecyclePhase;
use infrasim_core::test_utils::*;
use infrasim_core::validation::{compare_views, diff_engines, validate_determinism};
use infrasim_federation::{FederationConfig, OptimizerFactory, Synchronizer};
use infrasim_optimizer::MinCostFlowOptimizer;
use rust_decimal_macros::dec;
use std::sync::Arc;

const CONFIG_TOML: &str = r#"
iterations = 6
timestep = "1"
check_conservation = true
check_exchange = true
"#;

#[test]
fn config_from_toml_drives_twenty_ticks() {
    let config = SimConfig::from_toml_str(CONFIG_TOML).unwrap();
    assert_eq!(config, SimConfig::default());

    let mut engine = engine_with(west_east_scenario(), config);
    engine.run(20).unwrap();
    assert!(engine.diagnostics().is_empty());
    assert_eq!(engine.total_stock().get(Resource::People), dec!(10));
}

#[test]
fn optimizer_and_demand_following_agree() {
    let mut plain = engine_for(west_east_scenario());
    let mut optimized = engine_for(west_east_scenario());
    optimized.set_optimizer(Box::new(MinCostFlowOptimizer::default()));
    plain.run(20).unwrap();
    optimized.run(20).unwrap();

    assert_eq!(optimized.diagnostics().count(DiagnosticKind::OptimizerFallback), 0);
    let diff = diff_engines(&plain, &optimized);
    assert!(diff.is_identical, "{:?}", diff.element_diffs);
}

#[test]
fn federation_with_optimizer_matches_single_engine() {
    let scenario = west_east_scenario();
    let partitions = west_east_partitions(&scenario);
    let factory: OptimizerFactory =
        Arc::new(|| Box::new(MinCostFlowOptimizer::default()) as Box<dyn Optimizer>);
    let mut sync =
        Synchronizer::initialize(scenario.clone(), partitions, FederationConfig::default(), Some(factory))
            .unwrap();

    let mut engine = engine_for(scenario);
    engine.set_optimizer(Box::new(MinCostFlowOptimizer::default()));

    sync.run(20).unwrap();
    engine.run(20).unwrap();
    assert!(compare_views(&sync.elements().unwrap(), &engine.snapshot_all()).is_empty());
    assert_eq!(sync.state_hash(), engine.state_hash());
    assert!(sync.diagnostics().is_empty());
}

#[test]
fn east_plant_commissioned_on_schedule() {
    let mut engine = engine_for(west_east_scenario());
    let plant = engine.find("east plant").unwrap();
    let mut phases = Vec::new();
    for _ in 0..10 {
        engine.step().unwrap();
        phases.push(engine.element(plant).unwrap().lifecycle_phase());
    }
    use LifecyclePhase::*;
    assert_eq!(
        phases,
        vec![
            Empty,
            Empty,
            Empty,
            Empty,
            Empty,
            Commissioning,
            Commissioning,
            Operating,
            Operating,
            Operating
        ]
    );
}

#[test]
fn west_east_is_deterministic_over_forty_ticks() {
    let report = validate_determinism(&west_east_scenario(), &SimConfig::default(), 40).unwrap();
    assert!(report.is_deterministic(), "{:?}", report.divergence);
    assert_eq!(report.ticks, 40);
}

#[test]
fn forced_fallback_exports_one_warning_as_json() {
    let mut engine = engine_for(west_east_scenario());
    engine.set_optimizer(Box::new(ScriptedOptimizer::failing_on(&[2])));
    engine.run(5).unwrap();

    let json = engine.diagnostics().to_json().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    let entries = parsed.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert!(json.contains("OptimizerFallback"));
    assert!(json.contains("scripted"));
}
