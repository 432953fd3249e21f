//! Exchange protocol: directed resource transfer between elements.
//!
//! States that trade (see [`crate::state::Exchanges`]) carry an
//! [`ExchangeBook`] listing their counterparties and the demand/supply rates
//! they have published. Publication is two-phase, mirroring tick/tock:
//!
//! 1. During `iterate_tick` a customer publishes its *next* demand toward
//!    each supplier, and a supplier reads each customer's *committed*
//!    demand (from the previous iteration) to publish its *next* supply.
//! 2. `iterate_tock` commits both tables.
//!
//! Transfers become real during the macro tick through [`sent_to`] and
//! [`received_from`], which enforce spatial adjacency: resources may only
//! move from an element whose destination is the receiver's origin.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::element::{Element, ElementTable};
use crate::id::ElementId;
use crate::location::Location;
use crate::resource::{Resource, ResourceVector, Time};
use crate::staged::Staged;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A transfer between two elements whose locations are not adjacent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "incompatible exchange: '{sender}' at {sender_location} cannot send to '{receiver}' at {receiver_location} \
     (sender destination must equal receiver origin)"
)]
pub struct IncompatibleExchangeError {
    pub sender: String,
    pub sender_location: Location,
    pub receiver: String,
    pub receiver_location: Location,
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// The role a counterparty plays for the book's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeRole {
    /// The counterparty supplies the owner.
    Supplier,
    /// The counterparty buys from the owner.
    Customer,
}

/// A directed reference from a state to a counterparty for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeLink {
    pub counterparty: ElementId,
    pub resource: Resource,
    pub role: ExchangeRole,
}

// ---------------------------------------------------------------------------
// Book
// ---------------------------------------------------------------------------

/// Per-counterparty demand and supply bookkeeping for one exchanging state.
///
/// All rates are per unit of simulated time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeBook {
    links: Vec<ExchangeLink>,
    /// What the owner requests from each supplier.
    demand: Staged<BTreeMap<ElementId, ResourceVector>>,
    /// What the owner delivers to each customer.
    supply: Staged<BTreeMap<ElementId, ResourceVector>>,
}

impl ExchangeBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link. Duplicate links are ignored.
    pub fn add_link(&mut self, link: ExchangeLink) {
        if !self.links.contains(&link) {
            self.links.push(link);
        }
    }

    pub fn links(&self) -> &[ExchangeLink] {
        &self.links
    }

    pub fn has_links(&self) -> bool {
        !self.links.is_empty()
    }

    /// Resources `counterparty` is linked for under `role`.
    pub fn resources_for(&self, counterparty: ElementId, role: ExchangeRole) -> Vec<Resource> {
        self.links
            .iter()
            .filter(|l| l.counterparty == counterparty && l.role == role)
            .map(|l| l.resource)
            .collect()
    }

    /// Distinct counterparties with the given role, in link order.
    pub fn counterparties(&self, role: ExchangeRole) -> Vec<ElementId> {
        let mut out = Vec::new();
        for link in self.links.iter().filter(|l| l.role == role) {
            if !out.contains(&link.counterparty) {
                out.push(link.counterparty);
            }
        }
        out
    }

    /// Suppliers linked for `resource`, in link order.
    pub fn suppliers_of(&self, resource: Resource) -> Vec<ElementId> {
        self.links
            .iter()
            .filter(|l| l.role == ExchangeRole::Supplier && l.resource == resource)
            .map(|l| l.counterparty)
            .collect()
    }

    pub fn is_supplier(&self, id: ElementId) -> bool {
        self.links
            .iter()
            .any(|l| l.counterparty == id && l.role == ExchangeRole::Supplier)
    }

    pub fn is_customer(&self, id: ElementId) -> bool {
        self.links
            .iter()
            .any(|l| l.counterparty == id && l.role == ExchangeRole::Customer)
    }

    /// Committed demand rate toward `supplier`.
    pub fn demand_to(&self, supplier: ElementId) -> ResourceVector {
        self.demand.current().get(&supplier).copied().unwrap_or_default()
    }

    /// Committed supply rate toward `customer`.
    pub fn supply_to(&self, customer: ElementId) -> ResourceVector {
        self.supply.current().get(&customer).copied().unwrap_or_default()
    }

    /// Committed demand summed over all suppliers.
    pub fn total_demand(&self) -> ResourceVector {
        self.demand.current().values().copied().sum()
    }

    /// Committed supply summed over all customers.
    pub fn total_supply(&self) -> ResourceVector {
        self.supply.current().values().copied().sum()
    }

    /// Overwrite the committed supply of one resource toward `customer`.
    /// Dispatch uses this to move deliveries between suppliers after the
    /// exchange has settled.
    pub fn redirect_supply(&mut self, customer: ElementId, resource: Resource, rate: Decimal) {
        let mut table = self.supply.current().clone();
        let entry = table.entry(customer).or_default();
        *entry = entry.with(resource, rate);
        self.supply.reset(table);
    }

    /// Stage the next demand and supply tables.
    pub fn stage(&mut self, plan: ExchangePlan) {
        self.demand.stage(plan.demand);
        self.supply.stage(plan.supply);
    }

    pub fn commit(&mut self) {
        self.demand.commit();
        self.supply.commit();
    }

    /// Forget all published rates (links are kept).
    pub fn clear(&mut self) {
        self.demand.reset(BTreeMap::new());
        self.supply.reset(BTreeMap::new());
    }
}

// ---------------------------------------------------------------------------
// Iteration planning
// ---------------------------------------------------------------------------

/// Next demand/supply tables computed for one element during `iterate_tick`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangePlan {
    pub demand: BTreeMap<ElementId, ResourceVector>,
    pub supply: BTreeMap<ElementId, ResourceVector>,
}

/// Compute an element's next demand and supply from committed values only.
///
/// Customer demand is read from each customer's committed book; supply is
/// allocated pro rata when the element's offer capacity falls short.
///
/// Demand for a resource is split evenly across the suppliers linked for
/// it and is not re-spread when one of them offers less than its share, so
/// the customer may go short while another supplier has spare capacity.
/// When an optimizer is
/// installed the engine moves the committed supply between suppliers after
/// dispatch (see [`ExchangeBook::redirect_supply`]) and the shortfall is
/// covered there.
pub fn plan_exchange(element: &Element, duration: Time, elements: &ElementTable) -> ExchangePlan {
    let Some(exchanger) = element.state().as_exchanger() else {
        return ExchangePlan::default();
    };
    let book = exchanger.book();
    if !book.has_links() {
        return ExchangePlan::default();
    }
    let me = element.id();

    // Committed demand of each customer toward this element.
    let mut requested: Vec<(ElementId, ResourceVector)> = Vec::new();
    for customer in book.counterparties(ExchangeRole::Customer) {
        let resources = book.resources_for(customer, ExchangeRole::Customer);
        let demand = elements
            .get(customer)
            .and_then(|c| c.state().as_exchanger().map(|x| x.book().demand_to(me)))
            .unwrap_or_default()
            .restrict(&resources);
        requested.push((customer, demand));
    }
    let customer_demand: ResourceVector = requested.iter().map(|(_, d)| *d).sum();

    // Committed supply flowing in from this element's suppliers.
    let inbound: ResourceVector = book
        .counterparties(ExchangeRole::Supplier)
        .into_iter()
        .map(|supplier| {
            let resources = book.resources_for(supplier, ExchangeRole::Supplier);
            elements
                .get(supplier)
                .and_then(|s| s.state().as_exchanger().map(|x| x.book().supply_to(me)))
                .unwrap_or_default()
                .restrict(&resources)
        })
        .sum();

    let stock = element.stock();
    let needs = exchanger.needs(&stock, &customer_demand);
    let offer = exchanger.offer_capacity(&stock, duration, &inbound);

    let mut plan = ExchangePlan::default();

    // Split each needed resource evenly across its suppliers.
    for resource in Resource::ALL {
        let need = needs.get(resource);
        if need <= Decimal::ZERO {
            continue;
        }
        let suppliers = book.suppliers_of(resource);
        if suppliers.is_empty() {
            continue;
        }
        let share = need
            .checked_div(Decimal::from(suppliers.len()))
            .unwrap_or(Decimal::ZERO);
        for supplier in suppliers {
            let entry = plan.demand.entry(supplier).or_default();
            *entry = entry.with(resource, entry.get(resource).saturating_add(share));
        }
    }

    // Allocate supply, pro rata per resource when demand exceeds the offer.
    for (customer, demand) in requested {
        let mut allocated = ResourceVector::ZERO;
        for resource in Resource::ALL {
            let wanted = demand.get(resource);
            if wanted <= Decimal::ZERO {
                continue;
            }
            let total = customer_demand.get(resource);
            let available = offer.get(resource).max(Decimal::ZERO);
            let amount = if total <= available {
                wanted
            } else {
                wanted
                    .saturating_mul(available)
                    .checked_div(total)
                    .unwrap_or(Decimal::ZERO)
            };
            allocated = allocated.with(resource, amount);
        }
        plan.supply.insert(customer, allocated);
    }

    plan
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

fn check_adjacency(
    sender: &Element,
    receiver: &Element,
    amount: &ResourceVector,
) -> Result<(), IncompatibleExchangeError> {
    if amount.has_positive() && !sender.location().feeds(&receiver.location()) {
        return Err(IncompatibleExchangeError {
            sender: sender.name().to_string(),
            sender_location: sender.location(),
            receiver: receiver.name().to_string(),
            receiver_location: receiver.location(),
        });
    }
    Ok(())
}

/// Amount `sender` delivers to `receiver` over `duration`, per its committed
/// supply table.
pub fn sent_to(
    sender: &Element,
    receiver: &Element,
    duration: Time,
) -> Result<ResourceVector, IncompatibleExchangeError> {
    let amount = sender
        .state()
        .as_exchanger()
        .map(|x| x.book().supply_to(receiver.id()))
        .unwrap_or_default()
        .multiply(duration);
    check_adjacency(sender, receiver, &amount)?;
    Ok(amount)
}

/// Amount `receiver` takes from `sender` over `duration`. Only counterparties
/// the receiver lists as suppliers deliver, and only for linked resources.
pub fn received_from(
    receiver: &Element,
    sender: &Element,
    duration: Time,
) -> Result<ResourceVector, IncompatibleExchangeError> {
    let Some(rx) = receiver.state().as_exchanger() else {
        return Ok(ResourceVector::ZERO);
    };
    let resources = rx.book().resources_for(sender.id(), ExchangeRole::Supplier);
    if resources.is_empty() {
        return Ok(ResourceVector::ZERO);
    }
    let amount = sender
        .state()
        .as_exchanger()
        .map(|x| x.book().supply_to(receiver.id()))
        .unwrap_or_default()
        .restrict(&resources)
        .multiply(duration);
    check_adjacency(sender, receiver, &amount)?;
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use rust_decimal_macros::dec;

    #[test]
    fn book_links_are_deduplicated() {
        let mut book = ExchangeBook::new();
        let id = ElementId::default();
        let link = ExchangeLink {
            counterparty: id,
            resource: Resource::Water,
            role: ExchangeRole::Supplier,
        };
        book.add_link(link);
        book.add_link(link);
        assert_eq!(book.links().len(), 1);
        assert!(book.is_supplier(id));
        assert!(!book.is_customer(id));
    }

    #[test]
    fn staged_rates_commit_together() {
        let mut book = ExchangeBook::new();
        let id = ElementId::default();
        let mut plan = ExchangePlan::default();
        plan.demand.insert(id, ResourceVector::of(Resource::Water, dec!(4)));
        book.stage(plan);
        assert!(book.demand_to(id).is_zero());
        book.commit();
        assert_eq!(book.demand_to(id).get(Resource::Water), dec!(4));
        book.clear();
        assert!(book.total_demand().is_zero());
    }

    #[test]
    fn supplier_answers_committed_demand_one_iteration_later() {
        let (mut scenario, west) = single_node_scenario();
        let well = scenario.add_element(water_source("well", west, dec!(100)));
        let town = scenario.add_element(water_consumer("town", west, dec!(10)));
        scenario.connect(well, town, Resource::Water).unwrap();
        let mut engine = engine_for(scenario.build());

        // Iteration 1: the town publishes demand; the well has nothing to answer yet.
        engine.micro_iteration().unwrap();
        let well_el = engine.element(well).unwrap();
        let book = well_el.state().as_exchanger().unwrap().book();
        assert!(book.supply_to(town).is_zero());

        // Iteration 2: the well reads the committed demand.
        engine.micro_iteration().unwrap();
        let well_el = engine.element(well).unwrap();
        let book = well_el.state().as_exchanger().unwrap().book();
        assert_eq!(book.supply_to(town).get(Resource::Water), dec!(10));
    }

    #[test]
    fn short_supplier_allocates_pro_rata() {
        let (mut scenario, west) = single_node_scenario();
        let well = scenario.add_element(water_source("well", west, dec!(6)));
        let a = scenario.add_element(water_consumer("a", west, dec!(4)));
        let b = scenario.add_element(water_consumer("b", west, dec!(8)));
        scenario.connect(well, a, Resource::Water).unwrap();
        scenario.connect(well, b, Resource::Water).unwrap();
        let mut engine = engine_for(scenario.build());
        engine.micro_iteration().unwrap();
        engine.micro_iteration().unwrap();

        let book = engine.element(well).unwrap().state().as_exchanger().unwrap().book().clone();
        assert_eq!(book.supply_to(a).get(Resource::Water), dec!(2));
        assert_eq!(book.supply_to(b).get(Resource::Water), dec!(4));
    }

    #[test]
    fn sent_and_received_are_symmetric() {
        let (mut scenario, west) = single_node_scenario();
        let well = scenario.add_element(water_source("well", west, dec!(100)));
        let town = scenario.add_element(water_consumer("town", west, dec!(10)));
        scenario.connect(well, town, Resource::Water).unwrap();
        let mut engine = engine_for(scenario.build());
        engine.micro_iteration().unwrap();
        engine.micro_iteration().unwrap();

        let w = engine.element(well).unwrap();
        let t = engine.element(town).unwrap();
        let sent = sent_to(w, t, dec!(2)).unwrap();
        let received = received_from(t, w, dec!(2)).unwrap();
        assert_eq!(sent, received);
        assert_eq!(sent.get(Resource::Water), dec!(20));
    }

    #[test]
    fn non_adjacent_transfer_is_rejected() {
        let mut scenario = crate::scenario::ScenarioBuilder::new(dec!(0));
        let west = scenario.add_node("West");
        let east = scenario.add_node("East");
        let well = scenario.add_element(water_source("well", west, dec!(100)));
        let town = scenario.add_element(water_consumer("town", east, dec!(10)));
        scenario.connect(well, town, Resource::Water).unwrap();
        let mut engine = engine_for(scenario.build());
        engine.micro_iteration().unwrap();
        engine.micro_iteration().unwrap();

        let w = engine.element(well).unwrap();
        let t = engine.element(town).unwrap();
        let err = sent_to(w, t, dec!(1)).unwrap_err();
        assert_eq!(err.sender, "well");
        assert_eq!(err.receiver, "town");
        assert!(received_from(t, w, dec!(1)).is_err());
    }
}
