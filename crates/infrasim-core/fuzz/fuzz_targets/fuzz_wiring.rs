#![no_main]
use arbitrary::Arbitrary;
use infrasim_core::engine::{Engine, SimError};
use infrasim_core::config::SimConfig;
use infrasim_core::id::{ElementId, NodeId};
use infrasim_core::resource::Resource;
use infrasim_core::scenario::ScenarioBuilder;
use infrasim_core::test_utils::*;
use libfuzzer_sys::fuzz_target;
use rust_decimal::Decimal;

/// One scenario-building operation.
#[derive(Arbitrary, Debug)]
enum FuzzOp {
    AddNode,
    AddTown { node: u8, people: u8 },
    AddUtility { node: u8, reserves: u16 },
    AddPlant { node: u8 },
    AddField { node: u8 },
    AddAqueduct { from: u8, to: u8 },
    Connect { supplier: u8, customer: u8, resource: u8 },
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    ops: Vec<FuzzOp>,
    ticks: u8,
}

// Arbitrary wiring either steps cleanly or fails with an incompatible
// exchange. Stocks never go negative.
fuzz_target!(|input: FuzzInput| {
    let mut b = ScenarioBuilder::new(Decimal::ZERO);
    let mut nodes: Vec<NodeId> = vec![b.add_node("N0")];
    let mut elements: Vec<ElementId> = Vec::new();
    let pick = |nodes: &[NodeId], i: u8| nodes[i as usize % nodes.len()];

    for (i, op) in input.ops.iter().take(64).enumerate() {
        let name = format!("e{i}");
        match *op {
            FuzzOp::AddNode => nodes.push(b.add_node(format!("N{}", nodes.len()))),
            FuzzOp::AddTown { node, people } => {
                elements.push(b.add_element(social(&name, pick(&nodes, node), Decimal::from(people))));
            }
            FuzzOp::AddUtility { node, reserves } => {
                elements.push(b.add_element(water_utility(&name, pick(&nodes, node), Decimal::from(reserves))));
            }
            FuzzOp::AddPlant { node } => elements.push(b.add_element(power_plant(&name, pick(&nodes, node)))),
            FuzzOp::AddField { node } => elements.push(b.add_element(oil_field(&name, pick(&nodes, node)))),
            FuzzOp::AddAqueduct { from, to } => {
                let (from, to) = (pick(&nodes, from), pick(&nodes, to));
                if from != to {
                    elements.push(b.add_element(aqueduct(&name, from, to)));
                }
            }
            FuzzOp::Connect { supplier, customer, resource } => {
                if elements.len() >= 2 {
                    let s = elements[supplier as usize % elements.len()];
                    let c = elements[customer as usize % elements.len()];
                    let r = Resource::ALL[resource as usize % Resource::ALL.len()];
                    let _ = b.connect(s, c, r);
                }
            }
        }
    }

    let Ok(mut engine) = Engine::new(b.build(), SimConfig::default()) else {
        return;
    };
    engine.initialize().unwrap();
    for _ in 0..input.ticks.min(16) {
        match engine.step() {
            Ok(()) => {}
            Err(SimError::IncompatibleExchange(_)) => return,
            Err(other) => panic!("unexpected error: {other}"),
        }
        for element in engine.elements().values() {
            assert!(element.stock().is_non_negative());
        }
    }
});
