//! The simulation engine: owns a scenario's element table and drives it
//! through macro ticks.
//!
//! # Macro tick
//!
//! Each `step()` runs:
//! 1. **Micro-iterations** -- `iterations` passes of exchange planning. Every
//!    element computes its next demand/supply from committed values, then all
//!    elements commit together.
//! 2. **Dispatch** -- the optimizer (if installed) assigns rates and the
//!    committed supply is rerouted onto the dispatched suppliers; otherwise
//!    producers follow their committed supply.
//! 3. **Flows and checks** -- flows are computed for every element; the
//!    conservation and exchange-symmetry checks record diagnostics.
//! 4. **Commit** -- `tick` then `tock` on every element.
//! 5. **Bookkeeping** -- advance time and the tick counter, recompute the
//!    state hash.
//!
//! Steps 1 and 2-3 are exposed separately (`micro_iteration`,
//! `prepare_tick`, `commit_tick`) so a federation worker can interleave its
//! barriers. An engine can be scoped to an owned subset of elements; it then
//! only mutates those and mirrors the rest through [`Engine::import`].
//!
//! The iteration count is a fixed parameter. A scenario whose dependency
//! chains are longer than it settles on values from earlier iterations, and
//! the engine does not iterate further to compensate.

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;

use crate::config::{ConfigError, SimConfig};
use crate::diagnostic::{Diagnostic, DiagnosticLog};
use crate::element::{Element, ElementTable, Flows};
use crate::exchange::{ExchangePlan, ExchangeRole, IncompatibleExchangeError};
use crate::id::{ElementId, NodeId};
use crate::location::Node;
use crate::optimizer::{DemandSpec, Dispatch, DispatchProblem, LinkSpec, Optimizer, SourceSpec};
use crate::reroute;
use crate::resource::{Resource, ResourceVector, Time};
use crate::scenario::Scenario;
use crate::sim::{SimState, StateHash};
use crate::state::{InvalidStateError, State};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    InvalidState(#[from] InvalidStateError),
    #[error(transparent)]
    IncompatibleExchange(#[from] IncompatibleExchangeError),
    #[error("unknown element: {0:?}")]
    UnknownElement(ElementId),
    #[error("engine used before initialize")]
    NotInitialized,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Engine {
    nodes: Vec<Node>,
    elements: ElementTable,
    initial_time: Time,
    config: SimConfig,

    /// Tick counter and simulated time.
    pub sim_state: SimState,

    /// Elements this engine mutates. `None` means all of them.
    scope: Option<BTreeSet<ElementId>>,

    /// Whether this engine runs the consistency checks and reports optimizer
    /// fallbacks. Only one engine of a federation does.
    lead: bool,

    optimizer: Option<Box<dyn Optimizer>>,
    diagnostics: DiagnosticLog,

    /// Flows computed by `prepare_tick`, consumed by `commit_tick`.
    prepared: Option<BTreeMap<ElementId, Flows>>,

    last_state_hash: u64,
    initialized: bool,
}

impl Engine {
    /// Take a copy of `scenario`. Call [`Engine::initialize`] before stepping.
    pub fn new(scenario: Scenario, config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self {
            nodes: scenario.nodes,
            elements: scenario.elements,
            initial_time: scenario.initial_time,
            sim_state: SimState::new(scenario.initial_time),
            diagnostics: DiagnosticLog::new(config.diagnostic_capacity),
            config,
            scope: None,
            lead: true,
            optimizer: None,
            prepared: None,
            last_state_hash: 0,
            initialized: false,
        })
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Reset every element to its initial snapshot and validate state wiring.
    pub fn initialize(&mut self) -> Result<(), SimError> {
        let t0 = self.initial_time;
        for (_, element) in self.elements.iter_mut() {
            element.initialize(t0)?;
        }
        self.sim_state = SimState::new(t0);
        self.prepared = None;
        self.initialized = true;
        self.last_state_hash = self.compute_state_hash();
        tracing::info!(
            elements = self.elements.len(),
            nodes = self.nodes.len(),
            iterations = self.config.iterations,
            timestep = %self.config.timestep,
            "engine initialized"
        );
        Ok(())
    }

    pub fn set_optimizer(&mut self, optimizer: Box<dyn Optimizer>) {
        self.optimizer = Some(optimizer);
    }

    pub fn clear_optimizer(&mut self) -> Option<Box<dyn Optimizer>> {
        self.optimizer.take()
    }

    /// Restrict mutation to `owned`. A `lead` engine also runs the checks.
    pub fn set_scope(&mut self, owned: BTreeSet<ElementId>, lead: bool) {
        self.scope = Some(owned);
        self.lead = lead;
    }

    pub fn owns(&self, id: ElementId) -> bool {
        self.scope.as_ref().is_none_or(|s| s.contains(&id))
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    /// One exchange-planning pass over the owned elements.
    pub fn micro_iteration(&mut self) -> Result<(), SimError> {
        self.ensure_initialized()?;
        let duration = self.config.timestep;
        let owned = self.owned_ids();
        for (id, plan) in self.plan_all(&owned, duration) {
            if let Some(element) = self.elements.get_mut(id) {
                element.iterate_tick(plan);
            }
        }
        for id in owned {
            if let Some(element) = self.elements.get_mut(id) {
                element.iterate_tock();
            }
        }
        self.prepared = None;
        Ok(())
    }

    /// Dispatch rates, compute flows, and run the enabled checks. Nothing
    /// becomes visible until [`Engine::commit_tick`].
    pub fn prepare_tick(&mut self) -> Result<(), SimError> {
        self.ensure_initialized()?;
        self.dispatch();
        let flows = self.compute_flows()?;
        if self.lead {
            if self.config.check_conservation {
                let found = self.conservation_findings(&flows);
                self.report(found);
            }
            if self.config.check_exchange {
                let found = self.exchange_findings(&flows);
                self.report(found);
            }
        }
        self.prepared = Some(flows);
        Ok(())
    }

    /// Tick and tock the owned elements, then advance time.
    pub fn commit_tick(&mut self) -> Result<(), SimError> {
        self.ensure_initialized()?;
        let mut flows = match self.prepared.take() {
            Some(flows) => flows,
            None => {
                self.prepare_tick()?;
                self.prepared.take().unwrap_or_default()
            }
        };
        let now = self.sim_state.time;
        let duration = self.config.timestep;
        let owned = self.owned_ids();
        for &id in &owned {
            let element_flows = flows.remove(&id).unwrap_or_default();
            if let Some(element) = self.elements.get_mut(id) {
                element.tick(now, duration, element_flows);
            }
        }
        for &id in &owned {
            if let Some(element) = self.elements.get_mut(id) {
                element.tock();
            }
        }
        self.sim_state.time = self.sim_state.time.saturating_add(duration);
        self.sim_state.tick += 1;
        self.last_state_hash = self.compute_state_hash();
        tracing::debug!(
            tick = self.sim_state.tick,
            time = %self.sim_state.time,
            hash = self.last_state_hash,
            "macro tick committed"
        );
        Ok(())
    }

    /// One full macro tick.
    pub fn step(&mut self) -> Result<(), SimError> {
        for _ in 0..self.config.iterations {
            self.micro_iteration()?;
        }
        self.prepare_tick()?;
        self.commit_tick()
    }

    pub fn run(&mut self, ticks: u64) -> Result<(), SimError> {
        for _ in 0..ticks {
            self.step()?;
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<(), SimError> {
        if self.initialized {
            Ok(())
        } else {
            Err(SimError::NotInitialized)
        }
    }

    fn owned_ids(&self) -> Vec<ElementId> {
        self.elements
            .keys()
            .filter(|id| self.owns(*id))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn plan_all(&self, ids: &[ElementId], duration: Time) -> Vec<(ElementId, ExchangePlan)> {
        ids.iter()
            .filter_map(|&id| {
                let element = self.elements.get(id)?;
                Some((id, element.exchange_plan(duration, &self.elements)))
            })
            .collect()
    }

    #[cfg(feature = "parallel")]
    fn plan_all(&self, ids: &[ElementId], duration: Time) -> Vec<(ElementId, ExchangePlan)> {
        ids.par_iter()
            .filter_map(|&id| {
                let element = self.elements.get(id)?;
                Some((id, element.exchange_plan(duration, &self.elements)))
            })
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn compute_flows(&self) -> Result<BTreeMap<ElementId, Flows>, SimError> {
        let duration = self.config.timestep;
        self.elements
            .iter()
            .map(|(id, e)| -> Result<(ElementId, Flows), SimError> {
                Ok((id, e.flows(duration, &self.elements)?))
            })
            .collect()
    }

    #[cfg(feature = "parallel")]
    fn compute_flows(&self) -> Result<BTreeMap<ElementId, Flows>, SimError> {
        let duration = self.config.timestep;
        let ids: Vec<ElementId> = self.elements.keys().collect();
        let flows: Result<Vec<(ElementId, Flows)>, IncompatibleExchangeError> = ids
            .par_iter()
            .map(|&id| -> Result<(ElementId, Flows), IncompatibleExchangeError> {
                Ok((id, self.elements[id].flows(duration, &self.elements)?))
            })
            .collect();
        Ok(flows?.into_iter().collect())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    // Every element is dispatched, owned or not: flows and checks are
    // computed over the whole table from this copy.
    fn dispatch(&mut self) {
        let Some(mut optimizer) = self.optimizer.take() else {
            for (_, element) in self.elements.iter_mut() {
                if let Some(state) = element.state_mut() {
                    state.follow_demand();
                }
            }
            return;
        };

        let problem = self.dispatch_problem();
        match optimizer.optimize(&problem) {
            Ok(dispatch) => {
                let duration = problem.duration;
                let assigned: BTreeSet<ElementId> = problem
                    .sources
                    .iter()
                    .map(|s| s.element)
                    .chain(problem.links.iter().map(|l| l.element))
                    .collect();
                for id in assigned {
                    let rate = dispatch.assigned(id).divide(duration);
                    if let Some(state) = self.elements.get_mut(id).and_then(Element::state_mut) {
                        state.assign_rate(rate);
                    }
                }
                self.reroute_supply(&problem, &dispatch);
            }
            Err(err) => {
                tracing::warn!(
                    tick = self.sim_state.tick,
                    optimizer = optimizer.name(),
                    error = %err,
                    "optimizer failed; keeping previous rates"
                );
                if self.lead {
                    self.diagnostics.record(Diagnostic::OptimizerFallback {
                        optimizer: optimizer.name().to_string(),
                        reason: err.to_string(),
                        tick: self.sim_state.tick,
                    });
                }
                let held = self.dispatch_at_current_rates(&problem);
                self.reroute_supply(&problem, &held);
            }
        }
        self.optimizer = Some(optimizer);
    }

    /// The dispatch the current setpoints amount to.
    fn dispatch_at_current_rates(&self, problem: &DispatchProblem) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let entries = problem
            .sources
            .iter()
            .map(|s| (s.element, s.resource))
            .chain(problem.links.iter().map(|l| (l.element, l.resource)));
        for (id, resource) in entries {
            let rate = self
                .elements
                .get(id)
                .and_then(|e| e.state().delivery_rate())
                .unwrap_or_default()
                .get(resource);
            dispatch.assign(id, resource, rate.saturating_mul(problem.duration));
        }
        dispatch
    }

    /// Apply [`reroute::reroute_supply`] to the committed exchange books.
    fn reroute_supply(&mut self, problem: &DispatchProblem, dispatch: &Dispatch) {
        for ((supplier, customer, resource), rate) in
            reroute::reroute_supply(&self.elements, problem, dispatch)
        {
            if let Some(x) = self
                .elements
                .get_mut(supplier)
                .and_then(Element::state_mut)
                .and_then(State::as_exchanger_mut)
            {
                x.book_mut().redirect_supply(customer, resource, rate);
            }
        }
    }

    /// Capacities, costs, and committed demand as seen right now.
    pub fn dispatch_problem(&self) -> DispatchProblem {
        let duration = self.config.timestep;
        let mut problem = DispatchProblem {
            duration,
            ..DispatchProblem::default()
        };
        let mut demand: BTreeMap<(NodeId, Resource), Decimal> = BTreeMap::new();

        for (id, element) in &self.elements {
            let state = element.state();
            let location = element.location();
            let cost = state.unit_cost().unwrap_or_default();
            if let Some(capacity) = state.capacity() {
                for (resource, amount) in capacity.components() {
                    if amount <= Decimal::ZERO {
                        continue;
                    }
                    let capacity = amount.saturating_mul(duration);
                    if state.is_transport() {
                        problem.links.push(LinkSpec {
                            element: id,
                            from: location.origin,
                            to: location.destination,
                            resource,
                            capacity,
                            cost,
                        });
                    } else {
                        problem.sources.push(SourceSpec {
                            element: id,
                            node: location.origin,
                            resource,
                            capacity,
                            cost,
                        });
                    }
                }
            }
            if state.is_transport() {
                continue;
            }
            if let Some(x) = state.as_exchanger() {
                for (resource, amount) in x.book().total_demand().components() {
                    if amount > Decimal::ZERO {
                        let total = demand.entry((location.origin, resource)).or_default();
                        *total = total.saturating_add(amount.saturating_mul(duration));
                    }
                }
            }
        }

        problem.demands = demand
            .into_iter()
            .map(|((node, resource), amount)| DemandSpec {
                node,
                resource,
                amount,
            })
            .collect();
        problem
    }

    // -----------------------------------------------------------------------
    // Checks
    // -----------------------------------------------------------------------

    /// Compare inflow and outflow at every node for the flows the next
    /// commit would apply. Mismatches are recorded and returned.
    pub fn check_conservation(&mut self) -> Result<Vec<Diagnostic>, SimError> {
        self.ensure_initialized()?;
        let flows = self.compute_flows()?;
        let found = self.conservation_findings(&flows);
        self.report(found.clone());
        Ok(found)
    }

    /// Compare what each sender sends with what its receiver receives.
    pub fn check_exchange_symmetry(&mut self) -> Result<Vec<Diagnostic>, SimError> {
        self.ensure_initialized()?;
        let flows = self.compute_flows()?;
        let found = self.exchange_findings(&flows);
        self.report(found.clone());
        Ok(found)
    }

    fn within_tolerance(&self, a: &ResourceVector, b: &ResourceVector) -> bool {
        Resource::ALL
            .iter()
            .all(|&r| a.get(r).saturating_sub(b.get(r)).abs() <= self.config.tolerance)
    }

    fn conservation_findings(&self, flows: &BTreeMap<ElementId, Flows>) -> Vec<Diagnostic> {
        let mut found = Vec::new();
        for node in &self.nodes {
            let mut inflow = ResourceVector::ZERO;
            let mut outflow = ResourceVector::ZERO;
            for (id, element) in &self.elements {
                let location = element.location();
                if !location.touches(node.id) {
                    continue;
                }
                let Some(f) = flows.get(&id) else { continue };
                inflow += f.inflow_at(&location, node.id);
                outflow += f.outflow_at(&location, node.id);
            }
            if !self.within_tolerance(&inflow, &outflow) {
                found.push(Diagnostic::ConservationMismatch {
                    node: node.id,
                    inflow,
                    outflow,
                    tick: self.sim_state.tick,
                });
            }
        }
        found
    }

    fn exchange_findings(&self, flows: &BTreeMap<ElementId, Flows>) -> Vec<Diagnostic> {
        // Every (sender, receiver) pair declared by either side.
        let mut pairs: BTreeSet<(ElementId, ElementId)> = BTreeSet::new();
        for (id, element) in &self.elements {
            let Some(x) = element.state().as_exchanger() else { continue };
            for customer in x.book().counterparties(ExchangeRole::Customer) {
                pairs.insert((id, customer));
            }
            for supplier in x.book().counterparties(ExchangeRole::Supplier) {
                pairs.insert((supplier, id));
            }
        }

        let mut found = Vec::new();
        for (sender, receiver) in pairs {
            let sent = flows
                .get(&sender)
                .and_then(|f| f.sent_to.get(&receiver))
                .copied()
                .unwrap_or_default();
            let received = flows
                .get(&receiver)
                .and_then(|f| f.received_from.get(&sender))
                .copied()
                .unwrap_or_default();
            if !self.within_tolerance(&sent, &received) {
                found.push(Diagnostic::ExchangeAsymmetry {
                    sender,
                    receiver,
                    sent,
                    received,
                    tick: self.sim_state.tick,
                });
            }
        }
        found
    }

    fn report(&mut self, found: Vec<Diagnostic>) {
        for diagnostic in found {
            match &diagnostic {
                Diagnostic::ConservationMismatch {
                    node,
                    inflow,
                    outflow,
                    tick,
                } => tracing::warn!(%node, %inflow, %outflow, tick, "conservation mismatch"),
                Diagnostic::ExchangeAsymmetry {
                    sender,
                    receiver,
                    sent,
                    received,
                    tick,
                } => {
                    let sender = self.element_name(*sender);
                    let receiver = self.element_name(*receiver);
                    tracing::warn!(sender, receiver, %sent, %received, tick, "exchange asymmetry");
                }
                Diagnostic::OptimizerFallback { .. } => {}
            }
            self.diagnostics.record(diagnostic);
        }
    }

    fn element_name(&self, id: ElementId) -> &str {
        self.elements.get(id).map_or("<unknown>", Element::name)
    }

    // -----------------------------------------------------------------------
    // Federation support
    // -----------------------------------------------------------------------

    /// Committed copies of the owned elements.
    pub fn export_owned(&self) -> Vec<Element> {
        self.elements
            .iter()
            .filter(|(id, _)| self.owns(*id))
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Mirror committed copies of foreign elements. Owned elements are left
    /// alone; unknown ids are an error.
    pub fn import(&mut self, elements: &[Element]) -> Result<(), SimError> {
        for other in elements {
            let id = other.id();
            if self.owns(id) {
                continue;
            }
            let element = self
                .elements
                .get_mut(id)
                .ok_or(SimError::UnknownElement(id))?;
            element.mirror(other);
        }
        Ok(())
    }

    /// Recompute the state hash after foreign elements were imported.
    pub fn refresh_state_hash(&mut self) {
        self.last_state_hash = self.compute_state_hash();
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn elements(&self) -> &ElementTable {
        &self.elements
    }

    /// Look up an element id by name.
    pub fn find(&self, name: &str) -> Option<ElementId> {
        self.elements
            .iter()
            .find(|(_, e)| e.name() == name)
            .map(|(id, _)| id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn time(&self) -> Time {
        self.sim_state.time
    }

    pub fn tick(&self) -> u64 {
        self.sim_state.tick
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Sum of every element's committed stock.
    pub fn total_stock(&self) -> ResourceVector {
        self.elements.values().map(Element::stock).sum()
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut DiagnosticLog {
        &mut self.diagnostics
    }

    /// Hash of the committed state as of the last commit.
    pub fn state_hash(&self) -> u64 {
        self.last_state_hash
    }

    fn compute_state_hash(&self) -> u64 {
        let mut hash = StateHash::for_clock(&self.sim_state);
        for element in self.elements.values() {
            hash.element(
                &element.stock(),
                element.state_id(),
                &element.location(),
                element.time_in_state(),
            );
        }
        hash.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::DiagnosticKind;
    use crate::exchange::ExchangeBook;
    use crate::state::State;
    use crate::test_utils::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stepping_before_initialize_fails() {
        let (mut b, west) = single_node_scenario();
        b.add_element(water_source("well", west, dec!(1)));
        let mut engine = Engine::new(b.build(), SimConfig::default()).unwrap();
        assert!(matches!(engine.step(), Err(SimError::NotInitialized)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (b, _) = single_node_scenario();
        let config = SimConfig::default().with_iterations(0);
        assert!(matches!(
            Engine::new(b.build(), config),
            Err(SimError::Config(ConfigError::ZeroIterations))
        ));
    }

    #[test]
    fn step_advances_clock_and_hash() {
        let (mut b, west) = single_node_scenario();
        let well = b.add_element(water_source("well", west, dec!(100)));
        let town = b.add_element(water_consumer("town", west, dec!(10)));
        b.connect(well, town, Resource::Water).unwrap();
        let mut engine = engine_for(b.build());
        let before = engine.state_hash();
        engine.step().unwrap();
        assert_eq!(engine.tick(), 1);
        assert_eq!(engine.time(), dec!(1));
        assert_ne!(engine.state_hash(), before);
    }

    #[test]
    fn consumer_receives_what_it_needs() {
        let (mut b, west) = single_node_scenario();
        let well = b.add_element(water_source("well", west, dec!(100)));
        let town = b.add_element(water_consumer("town", west, dec!(10)));
        b.connect(well, town, Resource::Water).unwrap();
        let mut engine = engine_for(b.build());
        engine.run(3).unwrap();
        let flows = engine.element(town).unwrap().last_flows();
        assert_eq!(flows.received.get(Resource::Water), dec!(10));
        assert_eq!(flows.consumed.get(Resource::Water), dec!(10));
        let well_flows = engine.element(well).unwrap().last_flows();
        assert_eq!(well_flows.produced.get(Resource::Water), dec!(10));
        assert!(engine.diagnostics().is_empty());
    }

    #[test]
    fn unlisted_customer_is_an_asymmetry() {
        let (mut b, west) = single_node_scenario();
        let well = b.add_element(water_source("well", west, dec!(100)));
        let town = b.add_element(water_consumer("town", west, dec!(10)));
        b.connect(well, town, Resource::Water).unwrap();
        let mut engine = engine_for(b.build());

        // The town drops its supplier link but its demand is still on record.
        let mut book = ExchangeBook::new();
        let mut plan = ExchangePlan::default();
        plan.demand.insert(well, ResourceVector::of(Resource::Water, dec!(10)));
        book.stage(plan);
        book.commit();
        let x = engine.elements[town]
            .state_mut()
            .and_then(State::as_exchanger_mut)
            .unwrap();
        *x.book_mut() = book;

        engine.micro_iteration().unwrap();
        let found = engine.check_exchange_symmetry().unwrap();
        assert_eq!(found.len(), 1);
        assert!(matches!(
            &found[0],
            Diagnostic::ExchangeAsymmetry { sender, receiver, .. } if *sender == well && *receiver == town
        ));
        assert_eq!(engine.diagnostics().count(DiagnosticKind::ExchangeAsymmetry), 1);
    }

    #[test]
    fn scoped_engine_only_mutates_owned() {
        let (mut b, west) = single_node_scenario();
        let well = b.add_element(water_source("well", west, dec!(100)));
        let town = b.add_element(water_consumer("town", west, dec!(10)));
        b.connect(well, town, Resource::Water).unwrap();
        let mut engine = engine_for(b.build());
        engine.set_scope([town].into_iter().collect(), true);
        engine.micro_iteration().unwrap();
        engine.micro_iteration().unwrap();
        // The well never planned, so it answers nothing.
        let book = engine.element(well).unwrap().state().as_exchanger().unwrap().book().clone();
        assert!(book.supply_to(town).is_zero());
        assert!(engine.owns(town));
        assert!(!engine.owns(well));
    }

    #[test]
    fn import_mirrors_foreign_elements() {
        let (mut b, west) = single_node_scenario();
        let well = b.add_element(water_source("well", west, dec!(100)));
        let town = b.add_element(water_consumer("town", west, dec!(10)));
        b.connect(well, town, Resource::Water).unwrap();
        let scenario = b.build();
        let mut full = engine_for(scenario.clone());
        full.run(2).unwrap();

        let mut partial = engine_for(scenario);
        partial.set_scope([town].into_iter().collect(), false);
        partial.import(&full.export_owned()).unwrap();
        assert_eq!(partial.element(well), full.element(well));
        assert_ne!(partial.element(town), full.element(town));
    }

    fn two_wells_one_town() -> (Scenario, [ElementId; 3]) {
        let (mut b, west) = single_node_scenario();
        let first = b.add_element(water_source("first", west, dec!(100)));
        let second = b.add_element(water_source("second", west, dec!(100)));
        let town = b.add_element(water_consumer("town", west, dec!(10)));
        b.connect(first, town, Resource::Water).unwrap();
        b.connect(second, town, Resource::Water).unwrap();
        (b.build(), [first, second, town])
    }

    fn assert_balanced(engine: &Engine) {
        assert_eq!(engine.diagnostics().count(DiagnosticKind::ConservationMismatch), 0);
        for element in engine.elements().values() {
            assert!(element.last_flows().unmet.is_zero(), "{} went short", element.name());
        }
    }

    #[test]
    fn optimizer_moves_supply_onto_the_dispatched_well() {
        let (scenario, [first, second, town]) = two_wells_one_town();
        let mut engine = engine_for(scenario);
        // Serves demand from the first listed source.
        engine.set_optimizer(Box::new(ScriptedOptimizer::default()));

        for _ in 0..3 {
            engine.step().unwrap();
            assert_balanced(&engine);
            let served = engine.element(first).unwrap().last_flows();
            assert_eq!(served.produced.get(Resource::Water), dec!(10));
            assert_eq!(served.sent.get(Resource::Water), dec!(10));
            assert!(served.stored.is_zero());
            assert!(engine.element(second).unwrap().last_flows().sent.is_zero());
            assert_eq!(engine.element(town).unwrap().last_flows().received.get(Resource::Water), dec!(10));
        }
        assert!(engine.element(first).unwrap().stock().is_zero());
    }

    #[test]
    fn demand_following_splits_evenly() {
        let (scenario, [first, second, _]) = two_wells_one_town();
        let mut engine = engine_for(scenario);
        engine.run(2).unwrap();
        assert_balanced(&engine);
        for well in [first, second] {
            assert_eq!(engine.element(well).unwrap().last_flows().sent.get(Resource::Water), dec!(5));
        }
    }

    #[test]
    fn fallback_delivers_at_the_held_rates() {
        let (scenario, [first, second, town]) = two_wells_one_town();
        let mut engine = engine_for(scenario);
        engine.set_optimizer(Box::new(ScriptedOptimizer::failing_on(&[1])));
        engine.run(3).unwrap();
        assert_eq!(engine.diagnostics().count(DiagnosticKind::OptimizerFallback), 1);
        assert_balanced(&engine);
        assert!(engine.element(second).unwrap().last_flows().sent.is_zero());
        assert_eq!(engine.element(first).unwrap().last_flows().sent.get(Resource::Water), dec!(10));
        assert_eq!(engine.element(town).unwrap().last_flows().received.get(Resource::Water), dec!(10));
    }

    #[test]
    fn huge_quantities_saturate_instead_of_panicking() {
        let (mut b, west) = single_node_scenario();
        let well = b.add_element(water_source("well", west, Decimal::MAX));
        let town = b.add_element(water_consumer("town", west, Decimal::MAX));
        b.connect(well, town, Resource::Water).unwrap();
        let config = SimConfig::default().with_timestep(dec!(2));
        let mut engine = engine_with(b.build(), config);
        engine.set_optimizer(Box::new(ScriptedOptimizer::default()));

        engine.run(2).unwrap();
        assert_eq!(engine.tick(), 2);
        for element in engine.elements().values() {
            assert!(element.stock().is_non_negative());
        }
    }
}
