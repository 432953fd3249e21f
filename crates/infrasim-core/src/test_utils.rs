//! Shared test helpers for unit tests, integration tests, and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use std::collections::BTreeSet;

use rust_decimal::Decimal;

use crate::config::SimConfig;
use crate::element::{Element, ElementBuilder};
use crate::engine::Engine;
use crate::id::{NodeId, StateId};
use crate::location::Location;
use crate::optimizer::{Dispatch, DispatchProblem, OptimizeError, Optimizer};
use crate::resource::{ConversionMatrix, Resource, ResourceVector};
use crate::scenario::{Scenario, ScenarioBuilder};
use crate::state::{
    DistributingState, EmptyState, ExchangingState, ProducingState, RetrievingState, State,
    TransitionPhase, TransitioningState,
};

/// Decimal from a ratio of integers (`dec_ratio(1, 10)` is 0.1).
pub fn dec_ratio(numerator: i64, denominator: i64) -> Decimal {
    Decimal::from(numerator) / Decimal::from(denominator)
}

// ===========================================================================
// Engines
// ===========================================================================

/// An initialized engine with the default configuration.
pub fn engine_for(scenario: Scenario) -> Engine {
    engine_with(scenario, SimConfig::default())
}

pub fn engine_with(scenario: Scenario, config: SimConfig) -> Engine {
    let mut engine = Engine::new(scenario, config).expect("valid config");
    engine.initialize().expect("scenario initializes");
    engine
}

// ===========================================================================
// Element constructors
// ===========================================================================

/// A builder with one node named "West" at t0 = 0.
pub fn single_node_scenario() -> (ScenarioBuilder, NodeId) {
    let mut builder = ScenarioBuilder::new(Decimal::ZERO);
    let west = builder.add_node("West");
    (builder, west)
}

/// Produces water on demand up to `max_rate`, with no stock.
pub fn water_source(name: &str, node: NodeId, max_rate: Decimal) -> ElementBuilder {
    Element::builder(name, Location::nodal(node)).state(
        StateId(0),
        State::Producing(ProducingState::new(ResourceVector::of(Resource::Water, max_rate))),
    )
}

/// One person needing `rate` water per unit time.
pub fn water_consumer(name: &str, node: NodeId, rate: Decimal) -> ElementBuilder {
    Element::builder(name, Location::nodal(node))
        .stock(ResourceVector::of(Resource::People, Decimal::ONE))
        .state(
            StateId(0),
            State::Exchanging(ExchangingState::new(
                Resource::People,
                ResourceVector::of(Resource::Water, rate),
            )),
        )
}

/// A town of `population` needing 2 water and 1 electricity per person.
pub fn social(name: &str, node: NodeId, population: Decimal) -> ElementBuilder {
    let needs = ResourceVector::from_pairs(&[
        (Resource::Water, Decimal::TWO),
        (Resource::Electricity, Decimal::ONE),
    ]);
    Element::builder(name, Location::nodal(node))
        .stock(ResourceVector::of(Resource::People, population))
        .state(
            StateId(0),
            State::Exchanging(ExchangingState::new(Resource::People, needs)),
        )
}

/// Pumps an aquifer: one unit of reserves per unit of water, 0.1
/// electricity per unit of water.
pub fn water_utility(name: &str, node: NodeId, reserves: Decimal) -> ElementBuilder {
    let retrieving = RetrievingState::new(
        Resource::Reserves,
        Decimal::from(50),
        ConversionMatrix::new().with(Resource::Reserves, Resource::Water, Decimal::ONE),
    )
    .with_consumption(ConversionMatrix::new().with(
        Resource::Water,
        Resource::Electricity,
        dec_ratio(1, 10),
    ))
    .with_unit_cost(Decimal::ONE);
    Element::builder(name, Location::nodal(node))
        .stock(ResourceVector::of(Resource::Reserves, reserves))
        .state(StateId(0), State::Retrieving(retrieving))
}

/// Burns 0.5 oil per unit of electricity.
pub fn power_plant(name: &str, node: NodeId) -> ElementBuilder {
    let producing = ProducingState::new(ResourceVector::of(Resource::Electricity, Decimal::from(100)))
        .with_consumption(ConversionMatrix::new().with(
            Resource::Electricity,
            Resource::Oil,
            dec_ratio(1, 2),
        ))
        .with_unit_cost(Decimal::TWO);
    Element::builder(name, Location::nodal(node)).state(StateId(0), State::Producing(producing))
}

pub fn oil_field(name: &str, node: NodeId) -> ElementBuilder {
    let producing = ProducingState::new(ResourceVector::of(Resource::Oil, Decimal::from(100)))
        .with_unit_cost(Decimal::ONE);
    Element::builder(name, Location::nodal(node)).state(StateId(0), State::Producing(producing))
}

/// A water link losing 5% in transit.
pub fn aqueduct(name: &str, from: NodeId, to: NodeId) -> ElementBuilder {
    let distributing = DistributingState::new(ResourceVector::of(Resource::Water, Decimal::from(20)))
        .with_loss(dec_ratio(5, 100))
        .with_unit_cost(Decimal::ONE);
    Element::builder(name, Location::link(from, to))
        .state(StateId(0), State::Distributing(distributing))
}

/// Dormant until `activation`, then two ticks of commissioning paid from
/// its currency stock, then a power plant.
pub fn planned_plant(name: &str, node: NodeId, activation: Decimal) -> ElementBuilder {
    Element::builder(name, Location::nodal(node))
        .stock(ResourceVector::of(Resource::Currency, Decimal::from(100)))
        .state(
            StateId(0),
            State::Empty(EmptyState {
                activation_time: activation,
                next: StateId(1),
            }),
        )
        .state(
            StateId(1),
            State::Transitioning(TransitioningState {
                phase: TransitionPhase::Commissioning,
                duration: Decimal::TWO,
                total_cost: ResourceVector::of(Resource::Currency, Decimal::from(100)),
                next: StateId(2),
            }),
        )
        .state(
            StateId(2),
            State::Producing(ProducingState::new(ResourceVector::of(
                Resource::Electricity,
                Decimal::from(50),
            ))),
        )
}

// ===========================================================================
// West/East scenario
// ===========================================================================

/// Two nodes joined by an aqueduct from West to East.
///
/// West starts with 10 people and 3000 units of aquifer, East with no
/// people and 2000 units. Each node has a town, a water utility, a power
/// plant, and an oil field wired to one another; East also has a plant
/// that activates at t = 5.
pub fn west_east_scenario() -> Scenario {
    let mut b = ScenarioBuilder::new(Decimal::ZERO);
    let west = b.add_node("West");
    let east = b.add_node("East");

    let w_social = b.add_element(social("west social", west, Decimal::from(10)));
    let w_water = b.add_element(water_utility("west water", west, Decimal::from(3000)));
    let w_power = b.add_element(power_plant("west electricity", west));
    let w_oil = b.add_element(oil_field("west oil", west));

    let e_social = b.add_element(social("east social", east, Decimal::ZERO));
    let e_water = b.add_element(water_utility("east water", east, Decimal::from(2000)));
    let e_power = b.add_element(power_plant("east electricity", east));
    let e_oil = b.add_element(oil_field("east oil", east));
    let e_plant = b.add_element(planned_plant("east plant", east, Decimal::from(5)));

    let pipe = b.add_element(aqueduct("aqueduct", west, east));

    let wiring = [
        (w_water, w_social, Resource::Water),
        (w_power, w_social, Resource::Electricity),
        (w_power, w_water, Resource::Electricity),
        (w_oil, w_power, Resource::Oil),
        (e_water, e_social, Resource::Water),
        (e_power, e_social, Resource::Electricity),
        (e_power, e_water, Resource::Electricity),
        (e_oil, e_power, Resource::Oil),
        (e_plant, e_social, Resource::Electricity),
        (w_water, pipe, Resource::Water),
        (pipe, e_social, Resource::Water),
    ];
    for (supplier, customer, resource) in wiring {
        b.connect(supplier, customer, resource)
            .expect("west/east wiring uses known elements");
    }
    b.build()
}

/// A lossless road carrying up to `rate` people per unit time.
pub fn road(name: &str, from: NodeId, to: NodeId, rate: Decimal) -> ElementBuilder {
    let distributing = DistributingState::new(ResourceVector::of(Resource::People, rate));
    Element::builder(name, Location::link(from, to))
        .state(StateId(0), State::Distributing(distributing))
}

/// West's town of 10 lets up to 2 people a tick leave by road for East's
/// town of 5, which asks for 0.2 newcomers per resident per tick.
pub fn migration_scenario() -> Scenario {
    let mut b = ScenarioBuilder::new(Decimal::ZERO);
    let west = b.add_node("West");
    let east = b.add_node("East");

    let origin = Element::builder("west town", Location::nodal(west))
        .stock(ResourceVector::of(Resource::People, Decimal::from(10)))
        .state(
            StateId(0),
            State::Exchanging(
                ExchangingState::new(Resource::People, ResourceVector::ZERO)
                    .with_offers(ResourceVector::of(Resource::People, Decimal::TWO)),
            ),
        );
    let destination = Element::builder("east town", Location::nodal(east))
        .stock(ResourceVector::of(Resource::People, Decimal::from(5)))
        .state(
            StateId(0),
            State::Exchanging(ExchangingState::new(
                Resource::People,
                ResourceVector::of(Resource::People, dec_ratio(1, 5)),
            )),
        );
    let origin = b.add_element(origin);
    let destination = b.add_element(destination);
    let highway = b.add_element(road("highway", west, east, Decimal::from(5)));

    b.connect(origin, highway, Resource::People)
        .expect("migration wiring uses known elements");
    b.connect(highway, destination, Resource::People)
        .expect("migration wiring uses known elements");
    b.build()
}

/// Split a scenario's elements into West-only and everything else.
pub fn west_east_partitions(scenario: &Scenario) -> Vec<BTreeSet<crate::id::ElementId>> {
    let west = NodeId(0);
    let (a, b): (Vec<_>, Vec<_>) = scenario
        .elements
        .iter()
        .map(|(id, e)| (id, e.location()))
        .partition(|(_, loc)| loc.is_nodal() && loc.origin == west);
    vec![
        a.into_iter().map(|(id, _)| id).collect(),
        b.into_iter().map(|(id, _)| id).collect(),
    ]
}

// ===========================================================================
// Optimizers
// ===========================================================================

/// Serves each node's demand from local sources in listing order, and fails
/// on the calls listed in `fail_on` (0-based).
#[derive(Debug, Default)]
pub struct ScriptedOptimizer {
    pub fail_on: BTreeSet<usize>,
    pub calls: usize,
}

impl ScriptedOptimizer {
    pub fn failing_on(calls: &[usize]) -> Self {
        Self {
            fail_on: calls.iter().copied().collect(),
            calls: 0,
        }
    }
}

impl Optimizer for ScriptedOptimizer {
    fn name(&self) -> &str {
        "scripted"
    }

    fn optimize(&mut self, problem: &DispatchProblem) -> Result<Dispatch, OptimizeError> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on.contains(&call) {
            return Err(OptimizeError::Infeasible(format!("scripted failure on call {call}")));
        }
        let mut dispatch = Dispatch::default();
        for demand in &problem.demands {
            let mut remaining = demand.amount;
            for source in problem
                .sources
                .iter()
                .filter(|s| s.node == demand.node && s.resource == demand.resource)
            {
                if remaining <= Decimal::ZERO {
                    break;
                }
                let already = dispatch
                    .assignments
                    .get(&(source.element, source.resource))
                    .copied()
                    .unwrap_or_default();
                let take = remaining.min(source.capacity - already);
                if take > Decimal::ZERO {
                    dispatch.assign(source.element, source.resource, take);
                    remaining -= take;
                }
            }
        }
        Ok(dispatch)
    }
}
