//! Elements: named simulation entities owning stock and a current state.
//!
//! Mutable attributes live in a double-buffered [`ElementSnapshot`]. `tick`
//! fills the pending snapshot from committed values and `tock` commits it,
//! so elements evaluated in any order see the same world.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::exchange::{self, ExchangeLink, ExchangePlan, ExchangeRole, IncompatibleExchangeError};
use crate::id::{ElementId, NodeId, StateId};
use crate::location::Location;
use crate::resource::{Resource, ResourceVector, Time};
use crate::staged::Staged;
use crate::state::{FlowContext, InvalidStateError, LifecyclePhase, State};

/// Scenario-owned element storage. Cross-element references are keys into
/// this table.
pub type ElementTable = SlotMap<ElementId, Element>;

static NO_STATE: State = State::Default;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// The mutable attributes of an element at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub location: Location,
    pub stock: ResourceVector,
    pub state: StateId,
    pub parent: Option<ElementId>,
    /// Time spent in `state` so far.
    pub time_in_state: Time,
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

/// Everything that moved through an element during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flows {
    pub produced: ResourceVector,
    pub consumed: ResourceVector,
    pub stored: ResourceVector,
    pub retrieved: ResourceVector,
    /// Taken in at a link's origin.
    pub input: ResourceVector,
    /// Delivered at a link's destination.
    pub output: ResourceVector,
    pub sent: ResourceVector,
    pub received: ResourceVector,
    pub sent_to: BTreeMap<ElementId, ResourceVector>,
    pub received_from: BTreeMap<ElementId, ResourceVector>,
    /// Shortfall that neither stock nor curtailed consumption could cover.
    pub unmet: ResourceVector,
}

impl Flows {
    /// What this element brings into `node`.
    pub fn inflow_at(&self, location: &Location, node: NodeId) -> ResourceVector {
        if location.is_nodal() {
            if location.origin != node {
                return ResourceVector::ZERO;
            }
            return self.produced + self.retrieved + self.received;
        }
        let mut total = ResourceVector::ZERO;
        if location.origin == node {
            total += self.received;
        }
        if location.destination == node {
            total += self.output + self.retrieved;
        }
        total
    }

    /// What this element takes out of `node`.
    pub fn outflow_at(&self, location: &Location, node: NodeId) -> ResourceVector {
        if location.is_nodal() {
            if location.origin != node {
                return ResourceVector::ZERO;
            }
            return self.consumed + self.stored + self.sent;
        }
        let mut total = ResourceVector::ZERO;
        if location.origin == node {
            total += self.input;
        }
        if location.destination == node {
            total += self.sent + self.stored;
        }
        total
    }
}

// ---------------------------------------------------------------------------
// Element
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    id: ElementId,
    name: String,
    initial: ElementSnapshot,
    snapshot: Staged<ElementSnapshot>,
    /// The legal-state set.
    states: BTreeMap<StateId, State>,
    flows: Staged<Flows>,
}

impl Element {
    pub fn builder(name: impl Into<String>, location: Location) -> ElementBuilder {
        ElementBuilder::new(name, location)
    }

    // -- Accessors -----------------------------------------------------------

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> Location {
        self.snapshot.current().location
    }

    pub fn stock(&self) -> ResourceVector {
        self.snapshot.current().stock
    }

    pub fn parent(&self) -> Option<ElementId> {
        self.snapshot.current().parent
    }

    pub fn state_id(&self) -> StateId {
        self.snapshot.current().state
    }

    pub fn time_in_state(&self) -> Time {
        self.snapshot.current().time_in_state
    }

    pub fn snapshot(&self) -> &ElementSnapshot {
        self.snapshot.current()
    }

    pub fn initial(&self) -> &ElementSnapshot {
        &self.initial
    }

    /// The current state. An id outside the legal set (only possible before
    /// a successful `initialize`) reads as [`State::Default`].
    pub fn state(&self) -> &State {
        self.states.get(&self.state_id()).unwrap_or(&NO_STATE)
    }

    pub fn states(&self) -> &BTreeMap<StateId, State> {
        &self.states
    }

    pub fn lifecycle_phase(&self) -> LifecyclePhase {
        self.state().lifecycle_phase()
    }

    /// Flows of the last committed tick.
    pub fn last_flows(&self) -> &Flows {
        self.flows.current()
    }

    pub(crate) fn state_mut(&mut self) -> Option<&mut State> {
        let id = self.state_id();
        self.states.get_mut(&id)
    }

    pub(crate) fn set_parent(&mut self, parent: ElementId) {
        self.initial.parent = Some(parent);
        self.snapshot.reset(self.initial.clone());
    }

    /// Add `link` to every exchanging state in the legal set.
    pub(crate) fn link(&mut self, link: ExchangeLink) {
        for state in self.states.values_mut() {
            if let Some(x) = state.as_exchanger_mut() {
                x.book_mut().add_link(link);
            }
        }
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Reset every mutable attribute to its initial value and validate that
    /// the initial state and every scheduled successor are legal.
    pub fn initialize(&mut self, t0: Time) -> Result<(), InvalidStateError> {
        if !self.states.contains_key(&self.initial.state) {
            return Err(self.invalid(self.initial.state, "initial state".to_string()));
        }
        for (id, state) in &self.states {
            let Some(next) = state.next_state() else { continue };
            if !self.states.contains_key(&next) {
                return Err(self.invalid(next, format!("{} state {id}", state.kind_name())));
            }
        }
        for state in self.states.values_mut() {
            state.initialize();
        }
        self.snapshot.reset(self.initial.clone());
        self.flows.reset(Flows::default());
        tracing::debug!(element = %self.name, t0 = %t0, state = %self.initial.state, "element initialized");
        Ok(())
    }

    fn invalid(&self, state: StateId, referenced_by: String) -> InvalidStateError {
        InvalidStateError {
            element: self.name.clone(),
            state,
            referenced_by,
        }
    }

    // -- Micro-iteration -----------------------------------------------------

    /// Next demand/supply tables from committed values only.
    pub fn exchange_plan(&self, duration: Time, elements: &ElementTable) -> ExchangePlan {
        exchange::plan_exchange(self, duration, elements)
    }

    /// Stage the plan computed by [`Element::exchange_plan`].
    pub fn iterate_tick(&mut self, plan: ExchangePlan) {
        if let Some(x) = self.state_mut().and_then(State::as_exchanger_mut) {
            x.book_mut().stage(plan);
        }
    }

    pub fn iterate_tock(&mut self) {
        if let Some(x) = self.state_mut().and_then(State::as_exchanger_mut) {
            x.book_mut().commit();
        }
    }

    // -- Macro tick ----------------------------------------------------------

    /// Flows over a tick of `duration`, from committed values only.
    pub fn flows(
        &self,
        duration: Time,
        elements: &ElementTable,
    ) -> Result<Flows, IncompatibleExchangeError> {
        let state = self.state();
        let mut flows = Flows::default();

        if let Some(x) = state.as_exchanger() {
            let book = x.book();
            for customer in book.counterparties(ExchangeRole::Customer) {
                let Some(other) = elements.get(customer) else { continue };
                let amount = exchange::sent_to(self, other, duration)?;
                if !amount.is_zero() {
                    flows.sent += amount;
                    flows.sent_to.insert(customer, amount);
                }
            }
            for supplier in book.counterparties(ExchangeRole::Supplier) {
                let Some(other) = elements.get(supplier) else { continue };
                let amount = exchange::received_from(self, other, duration)?;
                if !amount.is_zero() {
                    flows.received += amount;
                    flows.received_from.insert(supplier, amount);
                }
            }
        }

        let stock = self.stock();
        let own_retrieved = match state.as_transformer() {
            Some(t) => {
                let ctx = FlowContext {
                    stock: &stock,
                    duration,
                    time_in_state: self.time_in_state(),
                    received: &flows.received,
                };
                flows.produced = t.produced(&ctx);
                flows.consumed = t.consumed(&ctx);
                t.retrieved(&ctx)
            }
            None => ResourceVector::ZERO,
        };

        // Balance: surplus is stored, a deficit is drawn from stock, then
        // covered by curtailing consumption.
        let mut retrieved = own_retrieved;
        for resource in Resource::ALL {
            let residual = flows
                .produced
                .get(resource)
                .saturating_add(flows.received.get(resource))
                .saturating_add(own_retrieved.get(resource))
                .saturating_sub(flows.consumed.get(resource))
                .saturating_sub(flows.sent.get(resource));
            if residual >= Decimal::ZERO {
                flows.stored = flows.stored.with(resource, residual);
                continue;
            }
            let deficit = -residual;
            let available = stock
                .get(resource)
                .saturating_sub(own_retrieved.get(resource))
                .max(Decimal::ZERO);
            let drawn = deficit.min(available);
            retrieved = retrieved.with(resource, retrieved.get(resource).saturating_add(drawn));
            let short = deficit.saturating_sub(drawn);
            if short > Decimal::ZERO {
                let curtailed = short.min(flows.consumed.get(resource).max(Decimal::ZERO));
                flows.consumed = flows
                    .consumed
                    .with(resource, flows.consumed.get(resource).saturating_sub(curtailed));
                flows.unmet = flows.unmet.with(resource, short.saturating_sub(curtailed));
            }
        }
        flows.retrieved = retrieved;

        if state.is_transport() {
            flows.input = flows.received;
            flows.output = flows.received - flows.consumed;
        }
        Ok(flows)
    }

    /// Compute the pending snapshot for a tick starting at `now`.
    pub fn tick(&mut self, now: Time, duration: Time, flows: Flows) {
        let current = self.snapshot.current().clone();
        let mut next = current.clone();
        next.stock = (current.stock + flows.stored - flows.retrieved).truncate_positive();

        let successor = self
            .state()
            .as_scheduled()
            .filter(|s| s.is_due(now, current.time_in_state, duration))
            .and_then(|s| s.next_state());
        match successor {
            Some(state) => {
                next.state = state;
                next.time_in_state = Decimal::ZERO;
            }
            None => next.time_in_state = current.time_in_state.saturating_add(duration),
        }

        self.snapshot.stage(next);
        self.flows.stage(flows);
    }

    /// Commit the pending snapshot. Entering a new state resets it.
    pub fn tock(&mut self) {
        let before = self.state_id();
        self.snapshot.commit();
        self.flows.commit();
        let after = self.state_id();
        if before != after {
            if let Some(state) = self.state_mut() {
                state.initialize();
            }
            tracing::info!(
                element = %self.name,
                from = %before,
                to = %after,
                phase = ?self.lifecycle_phase(),
                "state transition"
            );
        }
    }

    /// Overwrite this element with a committed copy from another engine.
    pub(crate) fn mirror(&mut self, other: &Element) {
        self.snapshot = other.snapshot.clone();
        self.states = other.states.clone();
        self.flows = other.flows.clone();
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ElementBuilder {
    name: String,
    location: Location,
    stock: ResourceVector,
    states: BTreeMap<StateId, State>,
    initial_state: Option<StateId>,
    parent: Option<ElementId>,
}

impl ElementBuilder {
    pub fn new(name: impl Into<String>, location: Location) -> Self {
        Self {
            name: name.into(),
            location,
            stock: ResourceVector::ZERO,
            states: BTreeMap::new(),
            initial_state: None,
            parent: None,
        }
    }

    pub fn stock(mut self, stock: ResourceVector) -> Self {
        self.stock = stock;
        self
    }

    /// Add a legal state.
    pub fn state(mut self, id: StateId, state: State) -> Self {
        self.states.insert(id, state);
        self
    }

    /// Defaults to the lowest state id.
    pub fn initial_state(mut self, id: StateId) -> Self {
        self.initial_state = Some(id);
        self
    }

    pub fn parent(mut self, parent: ElementId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn build(mut self, id: ElementId) -> Element {
        if self.states.is_empty() {
            self.states.insert(StateId(0), State::Default);
        }
        let state = self
            .initial_state
            .or_else(|| self.states.keys().next().copied())
            .unwrap_or(StateId(0));
        let initial = ElementSnapshot {
            location: self.location,
            stock: self.stock,
            state,
            parent: self.parent,
            time_in_state: Decimal::ZERO,
        };
        Element {
            id,
            name: self.name,
            snapshot: Staged::new(initial.clone()),
            initial,
            states: self.states,
            flows: Staged::new(Flows::default()),
        }
    }
}
