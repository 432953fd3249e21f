//! The element state catalog and the capabilities states compose.
//!
//! A [`State`] is bound to an element for a window of time and determines
//! the element's flows. States are a closed catalog dispatched by enum match
//! (no trait objects in storage); the orthogonal capabilities a state may
//! have are expressed as small traits:
//!
//! - [`Scheduled`] -- the state ends at a known time and names its successor.
//! - [`Transforms`] -- the state produces, consumes, or retrieves resources.
//! - [`Exchanges`] -- the state trades with counterparties through an
//!   [`ExchangeBook`].
//!
//! The engine asks a state for a capability with `as_scheduled`,
//! `as_transformer`, and `as_exchanger`, each an exhaustive match.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::ExchangeBook;
use crate::id::StateId;
use crate::resource::{ConversionMatrix, Resource, ResourceVector, Time};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A state refers to a successor outside its element's legal-state set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("element '{element}': state {state} is not in its legal-state set (referenced by {referenced_by})")]
pub struct InvalidStateError {
    pub element: String,
    pub state: StateId,
    /// Which configuration referenced the missing state.
    pub referenced_by: String,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Direction of a time-boxed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionPhase {
    Commissioning,
    Decommissioning,
}

/// Coarse phase of an element's existence, derived from its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecyclePhase {
    Empty,
    Commissioning,
    Operating,
    Decommissioning,
    Null,
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Inputs available to a state while computing one tick of flows.
#[derive(Debug, Clone, Copy)]
pub struct FlowContext<'a> {
    pub stock: &'a ResourceVector,
    pub duration: Time,
    /// Time already spent in this state before the tick.
    pub time_in_state: Time,
    /// Amount received from suppliers during the tick.
    pub received: &'a ResourceVector,
}

/// A state with a scheduled exit.
pub trait Scheduled {
    fn next_state(&self) -> Option<StateId>;

    /// Whether a tick of `duration` starting at `now` ends this state.
    fn is_due(&self, now: Time, time_in_state: Time, duration: Time) -> bool;
}

/// A state that produces, consumes, or draws on stock.
pub trait Transforms {
    fn produced(&self, ctx: &FlowContext<'_>) -> ResourceVector;
    fn consumed(&self, ctx: &FlowContext<'_>) -> ResourceVector;

    /// Amount the state itself extracts from the element's stock.
    fn retrieved(&self, ctx: &FlowContext<'_>) -> ResourceVector {
        let _ = ctx;
        ResourceVector::ZERO
    }
}

/// A state that trades with counterparties.
pub trait Exchanges {
    fn book(&self) -> &ExchangeBook;
    fn book_mut(&mut self) -> &mut ExchangeBook;

    /// Rate of each resource this state wants from its suppliers, given the
    /// committed demand of its own customers.
    fn needs(&self, stock: &ResourceVector, customer_demand: &ResourceVector) -> ResourceVector;

    /// Highest rate of each resource this state can deliver to customers.
    fn offer_capacity(
        &self,
        stock: &ResourceVector,
        duration: Time,
        inbound: &ResourceVector,
    ) -> ResourceVector;
}

// ---------------------------------------------------------------------------
// Shared schedule
// ---------------------------------------------------------------------------

/// Duration, running expense, and successor shared by the operating family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// How long the state lasts. `None` persists indefinitely.
    pub time_in_state: Option<Time>,
    pub next: Option<StateId>,
    /// Fixed expense per unit time.
    pub expense: ResourceVector,
}

impl Schedule {
    pub fn indefinite() -> Self {
        Self::default()
    }

    pub fn lasting(time_in_state: Time, next: StateId) -> Self {
        Self {
            time_in_state: Some(time_in_state),
            next: Some(next),
            expense: ResourceVector::ZERO,
        }
    }

    pub fn with_expense(mut self, expense: ResourceVector) -> Self {
        self.expense = expense;
        self
    }
}

impl Scheduled for Schedule {
    fn next_state(&self) -> Option<StateId> {
        self.next
    }

    fn is_due(&self, _now: Time, time_in_state: Time, duration: Time) -> bool {
        match (self.time_in_state, self.next) {
            (Some(limit), Some(_)) => time_in_state.saturating_add(duration) >= limit,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// Dormant until an absolute activation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyState {
    pub activation_time: Time,
    pub next: StateId,
}

/// Fixed duration, fixed expense, scheduled transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingState {
    pub schedule: Schedule,
}

/// Rate-based output plus a consumption matrix applied to that output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducingState {
    pub schedule: Schedule,
    /// Capacity per unit time.
    pub max_rate: ResourceVector,
    pub initial_rate: ResourceVector,
    /// Production setpoint per unit time (decision variable).
    pub rate: ResourceVector,
    /// Inputs consumed per unit produced.
    pub consumption: ConversionMatrix,
    /// Cost per unit produced, seen by the optimizer.
    pub unit_cost: Decimal,
    pub book: ExchangeBook,
}

/// Rate-limited throughput along a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributingState {
    pub schedule: Schedule,
    pub max_rate: ResourceVector,
    pub initial_rate: ResourceVector,
    /// Throughput setpoint per unit time (decision variable).
    pub rate: ResourceVector,
    /// Fraction of the input lost in transit.
    pub loss: Decimal,
    pub unit_cost: Decimal,
    pub book: ExchangeBook,
}

/// Extraction from a stock pool, converted into products.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievingState {
    pub schedule: Schedule,
    /// Stock component drawn down (typically [`Resource::Reserves`]).
    pub pool: Resource,
    pub max_rate: Decimal,
    pub initial_rate: Decimal,
    /// Extraction setpoint per unit time (decision variable).
    pub rate: Decimal,
    /// Products per unit of pool extracted.
    pub conversion: ConversionMatrix,
    /// Inputs consumed per unit of product.
    pub consumption: ConversionMatrix,
    pub unit_cost: Decimal,
    pub book: ExchangeBook,
}

/// Time-boxed commissioning or decommissioning with an amortized cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitioningState {
    pub phase: TransitionPhase,
    pub duration: Time,
    pub total_cost: ResourceVector,
    pub next: StateId,
}

/// Consumer and trader: demand scales with a basis stock (e.g. water per
/// person), surplus stock can be offered to customers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangingState {
    pub schedule: Schedule,
    pub basis: Resource,
    /// Demand per unit of basis stock per unit time.
    pub needs: ResourceVector,
    /// Most that can be offered from stock per unit time.
    pub offers: ResourceVector,
    /// Growth of the basis stock per unit stock per unit time.
    pub growth: Decimal,
    pub book: ExchangeBook,
}

/// The state catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// No flows, never transitions.
    #[default]
    Default,
    Empty(EmptyState),
    Operating(OperatingState),
    Producing(ProducingState),
    Distributing(DistributingState),
    Retrieving(RetrievingState),
    Transitioning(TransitioningState),
    Exchanging(ExchangingState),
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

impl ProducingState {
    pub fn new(max_rate: ResourceVector) -> Self {
        Self {
            schedule: Schedule::indefinite(),
            max_rate,
            initial_rate: ResourceVector::ZERO,
            rate: ResourceVector::ZERO,
            consumption: ConversionMatrix::new(),
            unit_cost: Decimal::ZERO,
            book: ExchangeBook::new(),
        }
    }

    pub fn with_consumption(mut self, consumption: ConversionMatrix) -> Self {
        self.consumption = consumption;
        self
    }

    pub fn with_initial_rate(mut self, rate: ResourceVector) -> Self {
        self.initial_rate = rate;
        self.rate = rate;
        self
    }

    pub fn with_unit_cost(mut self, cost: Decimal) -> Self {
        self.unit_cost = cost;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }
}

impl DistributingState {
    /// A lossless link whose setpoint starts at capacity.
    pub fn new(max_rate: ResourceVector) -> Self {
        Self {
            schedule: Schedule::indefinite(),
            max_rate,
            initial_rate: max_rate,
            rate: max_rate,
            loss: Decimal::ZERO,
            unit_cost: Decimal::ZERO,
            book: ExchangeBook::new(),
        }
    }

    pub fn with_loss(mut self, loss: Decimal) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_unit_cost(mut self, cost: Decimal) -> Self {
        self.unit_cost = cost;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }
}

impl RetrievingState {
    pub fn new(pool: Resource, max_rate: Decimal, conversion: ConversionMatrix) -> Self {
        Self {
            schedule: Schedule::indefinite(),
            pool,
            max_rate,
            initial_rate: Decimal::ZERO,
            rate: Decimal::ZERO,
            conversion,
            consumption: ConversionMatrix::new(),
            unit_cost: Decimal::ZERO,
            book: ExchangeBook::new(),
        }
    }

    pub fn with_consumption(mut self, consumption: ConversionMatrix) -> Self {
        self.consumption = consumption;
        self
    }

    pub fn with_unit_cost(mut self, cost: Decimal) -> Self {
        self.unit_cost = cost;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Pool extraction rate needed to deliver `products` per unit time.
    pub fn pool_needed(&self, products: &ResourceVector) -> Decimal {
        self.conversion
            .entries()
            .iter()
            .filter(|c| c.from == self.pool && c.factor > Decimal::ZERO)
            .map(|c| {
                products
                    .get(c.to)
                    .checked_div(c.factor)
                    .unwrap_or(Decimal::ZERO)
            })
            .fold(Decimal::ZERO, Decimal::max)
    }

    fn products_for(&self, extraction: Decimal) -> ResourceVector {
        ResourceVector::of(self.pool, extraction).transform(&self.conversion)
    }
}

impl ExchangingState {
    pub fn new(basis: Resource, needs: ResourceVector) -> Self {
        Self {
            schedule: Schedule::indefinite(),
            basis,
            needs,
            offers: ResourceVector::ZERO,
            growth: Decimal::ZERO,
            book: ExchangeBook::new(),
        }
    }

    pub fn with_offers(mut self, offers: ResourceVector) -> Self {
        self.offers = offers;
        self
    }

    pub fn with_growth(mut self, growth: Decimal) -> Self {
        self.growth = growth;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    fn need_rate(&self, stock: &ResourceVector) -> ResourceVector {
        self.needs.multiply(stock.get(self.basis)).truncate_positive()
    }
}

// ---------------------------------------------------------------------------
// Scheduled
// ---------------------------------------------------------------------------

impl Scheduled for EmptyState {
    fn next_state(&self) -> Option<StateId> {
        Some(self.next)
    }

    fn is_due(&self, now: Time, _time_in_state: Time, _duration: Time) -> bool {
        now >= self.activation_time
    }
}

impl Scheduled for TransitioningState {
    fn next_state(&self) -> Option<StateId> {
        Some(self.next)
    }

    fn is_due(&self, _now: Time, time_in_state: Time, duration: Time) -> bool {
        time_in_state.saturating_add(duration) >= self.duration
    }
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

impl Transforms for OperatingState {
    fn produced(&self, _ctx: &FlowContext<'_>) -> ResourceVector {
        ResourceVector::ZERO
    }

    fn consumed(&self, ctx: &FlowContext<'_>) -> ResourceVector {
        self.schedule.expense.multiply(ctx.duration)
    }
}

impl Transforms for ProducingState {
    fn produced(&self, ctx: &FlowContext<'_>) -> ResourceVector {
        self.rate.truncate_positive().multiply(ctx.duration)
    }

    fn consumed(&self, ctx: &FlowContext<'_>) -> ResourceVector {
        let produced = self.produced(ctx);
        self.schedule
            .expense
            .multiply(ctx.duration)
            .add(produced.transform(&self.consumption))
    }
}

impl Transforms for DistributingState {
    fn produced(&self, _ctx: &FlowContext<'_>) -> ResourceVector {
        ResourceVector::ZERO
    }

    /// Transit losses plus running expense; both come out of what is carried.
    fn consumed(&self, ctx: &FlowContext<'_>) -> ResourceVector {
        ctx.received
            .multiply(self.loss)
            .add(self.schedule.expense.multiply(ctx.duration))
    }
}

impl Transforms for RetrievingState {
    fn produced(&self, ctx: &FlowContext<'_>) -> ResourceVector {
        self.products_for(self.retrieved(ctx).get(self.pool))
    }

    fn consumed(&self, ctx: &FlowContext<'_>) -> ResourceVector {
        let extracted = self.retrieved(ctx);
        let produced = self.produced(ctx);
        extracted
            .add(produced.transform(&self.consumption))
            .add(self.schedule.expense.multiply(ctx.duration))
    }

    fn retrieved(&self, ctx: &FlowContext<'_>) -> ResourceVector {
        let wanted = self.rate.max(Decimal::ZERO).saturating_mul(ctx.duration);
        let available = ctx.stock.get(self.pool).max(Decimal::ZERO);
        ResourceVector::of(self.pool, wanted.min(available))
    }
}

impl Transforms for TransitioningState {
    fn produced(&self, _ctx: &FlowContext<'_>) -> ResourceVector {
        ResourceVector::ZERO
    }

    /// An even share of the total cost for the part of the tick still
    /// inside the transition window.
    fn consumed(&self, ctx: &FlowContext<'_>) -> ResourceVector {
        if self.duration <= Decimal::ZERO {
            return self.total_cost;
        }
        let remaining = self.duration.saturating_sub(ctx.time_in_state).max(Decimal::ZERO);
        let covered = ctx.duration.min(remaining);
        self.total_cost.multiply(covered).divide(self.duration)
    }
}

impl Transforms for ExchangingState {
    fn produced(&self, ctx: &FlowContext<'_>) -> ResourceVector {
        let growth = ctx
            .stock
            .get(self.basis)
            .saturating_mul(self.growth)
            .saturating_mul(ctx.duration);
        ResourceVector::of(self.basis, growth)
    }

    /// Consumes what it receives, up to its needs. Arrivals of the basis
    /// resource join the stock instead.
    fn consumed(&self, ctx: &FlowContext<'_>) -> ResourceVector {
        let wanted = self
            .need_rate(ctx.stock)
            .multiply(ctx.duration)
            .with(self.basis, Decimal::ZERO);
        ctx.received
            .truncate_positive()
            .min(wanted)
            .add(self.schedule.expense.multiply(ctx.duration))
    }
}

// ---------------------------------------------------------------------------
// Exchanges
// ---------------------------------------------------------------------------

impl Exchanges for ProducingState {
    fn book(&self) -> &ExchangeBook {
        &self.book
    }

    fn book_mut(&mut self) -> &mut ExchangeBook {
        &mut self.book
    }

    fn needs(&self, _stock: &ResourceVector, customer_demand: &ResourceVector) -> ResourceVector {
        let planned = customer_demand.truncate_positive().min(self.max_rate);
        planned
            .transform(&self.consumption)
            .add(self.schedule.expense)
    }

    fn offer_capacity(
        &self,
        stock: &ResourceVector,
        duration: Time,
        _inbound: &ResourceVector,
    ) -> ResourceVector {
        self.max_rate
            .truncate_positive()
            .add(stock.truncate_positive().divide(duration))
    }
}

impl Exchanges for DistributingState {
    fn book(&self) -> &ExchangeBook {
        &self.book
    }

    fn book_mut(&mut self) -> &mut ExchangeBook {
        &mut self.book
    }

    /// Gross intake needed upstream to deliver the downstream demand.
    fn needs(&self, _stock: &ResourceVector, customer_demand: &ResourceVector) -> ResourceVector {
        let delivered = customer_demand.truncate_positive().min(self.rate);
        let kept = Decimal::ONE - self.loss;
        delivered.divide(kept).add(self.schedule.expense)
    }

    fn offer_capacity(
        &self,
        stock: &ResourceVector,
        duration: Time,
        inbound: &ResourceVector,
    ) -> ResourceVector {
        let arriving = inbound.multiply(Decimal::ONE - self.loss);
        arriving
            .add(stock.truncate_positive().divide(duration))
            .min(self.rate)
            .truncate_positive()
    }
}

impl Exchanges for RetrievingState {
    fn book(&self) -> &ExchangeBook {
        &self.book
    }

    fn book_mut(&mut self) -> &mut ExchangeBook {
        &mut self.book
    }

    fn needs(&self, _stock: &ResourceVector, customer_demand: &ResourceVector) -> ResourceVector {
        let extraction = self.pool_needed(&customer_demand.truncate_positive()).min(self.max_rate);
        self.products_for(extraction)
            .transform(&self.consumption)
            .add(self.schedule.expense)
    }

    fn offer_capacity(
        &self,
        stock: &ResourceVector,
        duration: Time,
        _inbound: &ResourceVector,
    ) -> ResourceVector {
        let pool_rate = stock
            .get(self.pool)
            .max(Decimal::ZERO)
            .checked_div(duration)
            .unwrap_or(Decimal::ZERO)
            .min(self.max_rate);
        self.products_for(pool_rate)
            .add(stock.truncate_positive().divide(duration).with(self.pool, Decimal::ZERO))
    }
}

impl Exchanges for ExchangingState {
    fn book(&self) -> &ExchangeBook {
        &self.book
    }

    fn book_mut(&mut self) -> &mut ExchangeBook {
        &mut self.book
    }

    fn needs(&self, stock: &ResourceVector, _customer_demand: &ResourceVector) -> ResourceVector {
        self.need_rate(stock).add(self.schedule.expense)
    }

    fn offer_capacity(
        &self,
        stock: &ResourceVector,
        duration: Time,
        _inbound: &ResourceVector,
    ) -> ResourceVector {
        stock
            .truncate_positive()
            .divide(duration)
            .min(self.offers.truncate_positive())
    }
}

// ---------------------------------------------------------------------------
// State dispatch
// ---------------------------------------------------------------------------

impl State {
    pub fn as_scheduled(&self) -> Option<&dyn Scheduled> {
        match self {
            State::Default => None,
            State::Empty(s) => Some(s),
            State::Operating(s) => Some(&s.schedule),
            State::Producing(s) => Some(&s.schedule),
            State::Distributing(s) => Some(&s.schedule),
            State::Retrieving(s) => Some(&s.schedule),
            State::Transitioning(s) => Some(s),
            State::Exchanging(s) => Some(&s.schedule),
        }
    }

    pub fn as_transformer(&self) -> Option<&dyn Transforms> {
        match self {
            State::Default | State::Empty(_) => None,
            State::Operating(s) => Some(s),
            State::Producing(s) => Some(s),
            State::Distributing(s) => Some(s),
            State::Retrieving(s) => Some(s),
            State::Transitioning(s) => Some(s),
            State::Exchanging(s) => Some(s),
        }
    }

    pub fn as_exchanger(&self) -> Option<&dyn Exchanges> {
        match self {
            State::Producing(s) => Some(s),
            State::Distributing(s) => Some(s),
            State::Retrieving(s) => Some(s),
            State::Exchanging(s) => Some(s),
            State::Default
            | State::Empty(_)
            | State::Operating(_)
            | State::Transitioning(_) => None,
        }
    }

    pub fn as_exchanger_mut(&mut self) -> Option<&mut dyn Exchanges> {
        match self {
            State::Producing(s) => Some(s),
            State::Distributing(s) => Some(s),
            State::Retrieving(s) => Some(s),
            State::Exchanging(s) => Some(s),
            State::Default
            | State::Empty(_)
            | State::Operating(_)
            | State::Transitioning(_) => None,
        }
    }

    /// Human-readable variant name.
    pub fn kind_name(&self) -> &'static str {
        match self {
            State::Default => "default",
            State::Empty(_) => "empty",
            State::Operating(_) => "operating",
            State::Producing(_) => "producing",
            State::Distributing(_) => "distributing",
            State::Retrieving(_) => "retrieving",
            State::Transitioning(t) => match t.phase {
                TransitionPhase::Commissioning => "commissioning",
                TransitionPhase::Decommissioning => "decommissioning",
            },
            State::Exchanging(_) => "exchanging",
        }
    }

    pub fn lifecycle_phase(&self) -> LifecyclePhase {
        match self {
            State::Default => LifecyclePhase::Null,
            State::Empty(_) => LifecyclePhase::Empty,
            State::Transitioning(t) => match t.phase {
                TransitionPhase::Commissioning => LifecyclePhase::Commissioning,
                TransitionPhase::Decommissioning => LifecyclePhase::Decommissioning,
            },
            State::Operating(_)
            | State::Producing(_)
            | State::Distributing(_)
            | State::Retrieving(_)
            | State::Exchanging(_) => LifecyclePhase::Operating,
        }
    }

    /// Whether this state occupies a link (transport) rather than a node.
    pub fn is_transport(&self) -> bool {
        matches!(self, State::Distributing(_))
    }

    pub fn next_state(&self) -> Option<StateId> {
        self.as_scheduled().and_then(|s| s.next_state())
    }

    /// Reset runtime values to their configured starting point.
    pub fn initialize(&mut self) {
        match self {
            State::Producing(s) => {
                s.rate = s.initial_rate;
                s.book.clear();
            }
            State::Distributing(s) => {
                s.rate = s.initial_rate;
                s.book.clear();
            }
            State::Retrieving(s) => {
                s.rate = s.initial_rate;
                s.book.clear();
            }
            State::Exchanging(s) => s.book.clear(),
            State::Default
            | State::Empty(_)
            | State::Operating(_)
            | State::Transitioning(_) => {}
        }
    }

    // -- Decision variables --------------------------------------------------

    /// Current flow-rate setpoint, for states that have one. Retrieval rates
    /// are reported on the pool component.
    pub fn rate(&self) -> Option<ResourceVector> {
        match self {
            State::Producing(s) => Some(s.rate),
            State::Distributing(s) => Some(s.rate),
            State::Retrieving(s) => Some(ResourceVector::of(s.pool, s.rate)),
            _ => None,
        }
    }

    /// Current setpoint in delivered resources, the unit the optimizer
    /// assigns in.
    pub fn delivery_rate(&self) -> Option<ResourceVector> {
        match self {
            State::Producing(s) => Some(s.rate),
            State::Distributing(s) => Some(s.rate),
            State::Retrieving(s) => Some(s.products_for(s.rate.max(Decimal::ZERO))),
            _ => None,
        }
    }

    /// Highest rate the optimizer may assign, expressed in delivered
    /// resources (retrieval capacity is converted to products).
    pub fn capacity(&self) -> Option<ResourceVector> {
        match self {
            State::Producing(s) => Some(s.max_rate.truncate_positive()),
            State::Distributing(s) => Some(s.max_rate.truncate_positive()),
            State::Retrieving(s) => Some(s.products_for(s.max_rate.max(Decimal::ZERO))),
            _ => None,
        }
    }

    pub fn unit_cost(&self) -> Option<Decimal> {
        match self {
            State::Producing(s) => Some(s.unit_cost),
            State::Distributing(s) => Some(s.unit_cost),
            State::Retrieving(s) => Some(s.unit_cost),
            _ => None,
        }
    }

    /// Apply an assigned delivery rate (per unit time). Retrieval converts
    /// the product rate back into a pool extraction rate.
    pub fn assign_rate(&mut self, delivered: ResourceVector) {
        match self {
            State::Producing(s) => s.rate = delivered.min(s.max_rate).truncate_positive(),
            State::Distributing(s) => s.rate = delivered.min(s.max_rate).truncate_positive(),
            State::Retrieving(s) => s.rate = s.pool_needed(&delivered).min(s.max_rate),
            _ => {}
        }
    }

    /// Demand-following dispatch: match the committed supply, bounded by
    /// capacity. Links stay fully open.
    pub fn follow_demand(&mut self) {
        match self {
            State::Producing(s) => {
                s.rate = s.book.total_supply().min(s.max_rate).truncate_positive();
            }
            State::Distributing(s) => s.rate = s.max_rate,
            State::Retrieving(s) => {
                let supply = s.book.total_supply();
                s.rate = s.pool_needed(&supply).min(s.max_rate);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ctx<'a>(stock: &'a ResourceVector, received: &'a ResourceVector, tis: Time) -> FlowContext<'a> {
        FlowContext {
            stock,
            duration: dec!(1),
            time_in_state: tis,
            received,
        }
    }

    #[test]
    fn producing_consumes_through_matrix() {
        let mut p = ProducingState::new(ResourceVector::of(Resource::Electricity, dec!(10)))
            .with_consumption(ConversionMatrix::new().with(Resource::Electricity, Resource::Oil, dec!(0.5)));
        p.rate = ResourceVector::of(Resource::Electricity, dec!(8));
        let zero = ResourceVector::ZERO;
        let c = ctx(&zero, &zero, dec!(0));
        assert_eq!(p.produced(&c).get(Resource::Electricity), dec!(8));
        assert_eq!(p.consumed(&c).get(Resource::Oil), dec!(4.0));
    }

    #[test]
    fn producing_needs_follow_customer_demand_up_to_capacity() {
        let p = ProducingState::new(ResourceVector::of(Resource::Electricity, dec!(10)))
            .with_consumption(ConversionMatrix::new().with(Resource::Electricity, Resource::Oil, dec!(0.5)));
        let demand = ResourceVector::of(Resource::Electricity, dec!(30));
        let needs = p.needs(&ResourceVector::ZERO, &demand);
        assert_eq!(needs.get(Resource::Oil), dec!(5.0));
    }

    #[test]
    fn transitioning_amortizes_cost() {
        let t = TransitioningState {
            phase: TransitionPhase::Commissioning,
            duration: dec!(4),
            total_cost: ResourceVector::of(Resource::Currency, dec!(100)),
            next: StateId(1),
        };
        let zero = ResourceVector::ZERO;
        assert_eq!(t.consumed(&ctx(&zero, &zero, dec!(0))).get(Resource::Currency), dec!(25));
        // Only half a unit of time remains in the window.
        assert_eq!(t.consumed(&ctx(&zero, &zero, dec!(3.5))).get(Resource::Currency), dec!(12.5));
        assert!(!t.is_due(dec!(0), dec!(2), dec!(1)));
        assert!(t.is_due(dec!(0), dec!(3), dec!(1)));
    }

    #[test]
    fn empty_due_at_activation_time() {
        let e = EmptyState {
            activation_time: dec!(5),
            next: StateId(1),
        };
        assert!(!e.is_due(dec!(4), dec!(4), dec!(1)));
        assert!(e.is_due(dec!(5), dec!(5), dec!(1)));
    }

    #[test]
    fn schedule_without_duration_never_due() {
        let s = Schedule::indefinite();
        assert!(!s.is_due(dec!(100), dec!(100), dec!(1)));
        let s = Schedule::lasting(dec!(3), StateId(2));
        assert!(!s.is_due(dec!(0), dec!(1), dec!(1)));
        assert!(s.is_due(dec!(0), dec!(2), dec!(1)));
    }

    #[test]
    fn retrieving_is_bounded_by_pool_stock() {
        let mut r = RetrievingState::new(
            Resource::Reserves,
            dec!(50),
            ConversionMatrix::new().with(Resource::Reserves, Resource::Water, dec!(1)),
        );
        r.rate = dec!(50);
        let stock = ResourceVector::of(Resource::Reserves, dec!(20));
        let zero = ResourceVector::ZERO;
        let c = ctx(&stock, &zero, dec!(0));
        assert_eq!(r.retrieved(&c).get(Resource::Reserves), dec!(20));
        assert_eq!(r.produced(&c).get(Resource::Water), dec!(20));
        assert_eq!(r.consumed(&c).get(Resource::Reserves), dec!(20));
    }

    #[test]
    fn retrieving_pool_needed_inverts_conversion() {
        let r = RetrievingState::new(
            Resource::Reserves,
            dec!(50),
            ConversionMatrix::new().with(Resource::Reserves, Resource::Water, dec!(2)),
        );
        let needed = r.pool_needed(&ResourceVector::of(Resource::Water, dec!(10)));
        assert_eq!(needed, dec!(5));
    }

    #[test]
    fn exchanging_consumes_received_up_to_needs() {
        let x = ExchangingState::new(Resource::People, ResourceVector::of(Resource::Water, dec!(2)));
        let stock = ResourceVector::of(Resource::People, dec!(10));
        let received = ResourceVector::of(Resource::Water, dec!(25));
        let c = ctx(&stock, &received, dec!(0));
        assert_eq!(x.consumed(&c).get(Resource::Water), dec!(20));
        assert_eq!(x.needs(&stock, &ResourceVector::ZERO).get(Resource::Water), dec!(20));
    }

    #[test]
    fn arriving_basis_is_not_consumed() {
        let needs = ResourceVector::from_pairs(&[(Resource::People, dec!(0.2)), (Resource::Water, dec!(2))]);
        let x = ExchangingState::new(Resource::People, needs);
        let stock = ResourceVector::of(Resource::People, dec!(5));
        let received = ResourceVector::from_pairs(&[(Resource::People, dec!(1)), (Resource::Water, dec!(10))]);
        let c = ctx(&stock, &received, dec!(0));
        let consumed = x.consumed(&c);
        assert_eq!(consumed.get(Resource::People), dec!(0));
        assert_eq!(consumed.get(Resource::Water), dec!(10));
        // Migrants are still asked for.
        assert_eq!(x.needs(&stock, &ResourceVector::ZERO).get(Resource::People), dec!(1.0));
    }

    #[test]
    fn exchanging_growth_produces_basis() {
        let x = ExchangingState::new(Resource::People, ResourceVector::ZERO).with_growth(dec!(0.1));
        let stock = ResourceVector::of(Resource::People, dec!(10));
        let zero = ResourceVector::ZERO;
        assert_eq!(x.produced(&ctx(&stock, &zero, dec!(0))).get(Resource::People), dec!(1.0));
    }

    #[test]
    fn distributing_offer_limited_by_inbound_and_rate() {
        let d = DistributingState::new(ResourceVector::of(Resource::People, dec!(3)));
        let inbound = ResourceVector::of(Resource::People, dec!(5));
        let offer = d.offer_capacity(&ResourceVector::ZERO, dec!(1), &inbound);
        assert_eq!(offer.get(Resource::People), dec!(3));
        let offer = d.offer_capacity(&ResourceVector::ZERO, dec!(1), &ResourceVector::of(Resource::People, dec!(1)));
        assert_eq!(offer.get(Resource::People), dec!(1));
    }

    #[test]
    fn capabilities_by_variant() {
        assert!(State::Default.as_transformer().is_none());
        assert!(State::Default.as_scheduled().is_none());
        let op = State::Operating(OperatingState::default());
        assert!(op.as_exchanger().is_none());
        assert!(op.as_transformer().is_some());
        let x = State::Exchanging(ExchangingState::new(Resource::People, ResourceVector::ZERO));
        assert!(x.as_exchanger().is_some());
    }

    #[test]
    fn lifecycle_phases() {
        let t = State::Transitioning(TransitioningState {
            phase: TransitionPhase::Decommissioning,
            duration: dec!(1),
            total_cost: ResourceVector::ZERO,
            next: StateId(0),
        });
        assert_eq!(t.lifecycle_phase(), LifecyclePhase::Decommissioning);
        assert_eq!(t.kind_name(), "decommissioning");
        assert_eq!(State::Default.lifecycle_phase(), LifecyclePhase::Null);
    }

    #[test]
    fn assign_rate_respects_capacity() {
        let mut s = State::Producing(ProducingState::new(ResourceVector::of(Resource::Water, dec!(5))));
        s.assign_rate(ResourceVector::of(Resource::Water, dec!(9)));
        assert_eq!(s.rate().unwrap().get(Resource::Water), dec!(5));
    }

    #[test]
    fn initialize_restores_initial_rate() {
        let mut s = State::Producing(
            ProducingState::new(ResourceVector::of(Resource::Water, dec!(5)))
                .with_initial_rate(ResourceVector::of(Resource::Water, dec!(2))),
        );
        s.assign_rate(ResourceVector::of(Resource::Water, dec!(4)));
        s.initialize();
        assert_eq!(s.rate().unwrap().get(Resource::Water), dec!(2));
    }
}
