//! Moving committed supply between suppliers after an optimizer dispatch.
//!
//! The exchange settles on an even split of each customer's demand across
//! its suppliers, but the optimizer may have given one supplier everything
//! and another nothing. Before flows are computed the engine redraws every
//! customer's supply from the dispatched elements:
//!
//! 1. End customers (everything but links) are refilled up to their
//!    committed demand, cheapest supplier first. A dispatched source or
//!    link can give its assignment plus its stock.
//! 2. Links then draw what they now have to pass on from their own
//!    suppliers, downstream links first.
//! 3. Links are clamped, upstream first, to what actually reaches them.
//!
//! No dispatched element ends up sending more than it can cover, so the
//! rerouted exchange stays conservative even when the optimizer's answer
//! cannot be delivered in full.

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;

use crate::element::ElementTable;
use crate::exchange::ExchangeRole;
use crate::id::ElementId;
use crate::optimizer::{Dispatch, DispatchProblem};
use crate::resource::{Resource, ResourceVector};

/// Supply rate from `supplier` to `customer` for one resource.
pub type Reroute = ((ElementId, ElementId, Resource), Decimal);

struct Rerouting<'a> {
    elements: &'a ElementTable,
    problem: &'a DispatchProblem,
    /// What each dispatched (element, resource) can still give per unit time.
    budget: BTreeMap<(ElementId, Resource), Decimal>,
    links: BTreeSet<(ElementId, Resource)>,
    rates: BTreeMap<(ElementId, ElementId, Resource), Decimal>,
}

/// New supply rates for every (supplier, customer, resource) the dispatch
/// touches.
pub fn reroute_supply(
    elements: &ElementTable,
    problem: &DispatchProblem,
    dispatch: &Dispatch,
) -> Vec<Reroute> {
    let per_unit_time = |q: Decimal| q.checked_div(problem.duration).unwrap_or(Decimal::ZERO);
    let held = |id: ElementId, resource: Resource| {
        elements
            .get(id)
            .map_or(Decimal::ZERO, |e| e.stock().get(resource).max(Decimal::ZERO))
    };

    let mut budget = BTreeMap::new();
    let sources = problem.sources.iter().map(|s| (s.element, s.resource));
    let links = problem.links.iter().map(|l| (l.element, l.resource));
    for (id, resource) in sources.chain(links) {
        let assigned = dispatch
            .assignments
            .get(&(id, resource))
            .copied()
            .unwrap_or_default();
        budget.insert(
            (id, resource),
            per_unit_time(assigned).saturating_add(per_unit_time(held(id, resource))),
        );
    }

    let mut rerouting = Rerouting {
        elements,
        problem,
        budget,
        links: problem.links.iter().map(|l| (l.element, l.resource)).collect(),
        rates: BTreeMap::new(),
    };
    rerouting.refill_end_customers();
    let order = rerouting.downstream_first();
    for &(link, resource) in &order {
        rerouting.refill_link(link, resource);
    }
    for &(link, resource) in order.iter().rev() {
        rerouting.clamp_link(link, resource);
    }
    rerouting.rates.into_iter().collect()
}

impl Rerouting<'_> {
    fn refill_end_customers(&mut self) {
        let elements = self.elements;
        for (customer, element) in elements {
            if element.state().is_transport() {
                continue;
            }
            let Some(x) = element.state().as_exchanger() else {
                continue;
            };
            let book = x.book();
            for resource in Resource::ALL {
                let wanted = book
                    .suppliers_of(resource)
                    .into_iter()
                    .filter(|&s| self.budget.contains_key(&(s, resource)))
                    .fold(Decimal::ZERO, |acc, s| {
                        acc.saturating_add(book.demand_to(s).get(resource).max(Decimal::ZERO))
                    });
                self.fill(customer, resource, wanted);
            }
        }
    }

    /// Draw what `link` must pass on from its dispatched suppliers.
    fn refill_link(&mut self, link: ElementId, resource: Resource) {
        let elements = self.elements;
        let Some(element) = elements.get(link) else {
            return;
        };
        let Some(x) = element.state().as_exchanger() else {
            return;
        };
        let outgoing = self.outgoing(link, resource);
        let wanted = x
            .needs(&element.stock(), &ResourceVector::of(resource, outgoing))
            .get(resource);
        self.fill(link, resource, wanted);
    }

    /// Scale `link`'s deliveries down to what reaches it.
    fn clamp_link(&mut self, link: ElementId, resource: Resource) {
        let elements = self.elements;
        let Some(element) = elements.get(link) else {
            return;
        };
        let Some(x) = element.state().as_exchanger() else {
            return;
        };
        let arriving = x
            .book()
            .suppliers_of(resource)
            .into_iter()
            .fold(Decimal::ZERO, |acc, s| acc.saturating_add(self.rate(s, link, resource)));
        let deliverable = x
            .offer_capacity(
                &element.stock(),
                self.problem.duration,
                &ResourceVector::of(resource, arriving),
            )
            .get(resource);
        let outgoing = self.outgoing(link, resource);
        if outgoing <= deliverable {
            return;
        }
        for ((supplier, _, r), rate) in self.rates.iter_mut() {
            if *supplier == link && *r == resource {
                *rate = rate
                    .saturating_mul(deliverable)
                    .checked_div(outgoing)
                    .unwrap_or(Decimal::ZERO);
            }
        }
    }

    /// Hand out up to `wanted` to `customer` from its dispatched suppliers,
    /// cheapest first.
    fn fill(&mut self, customer: ElementId, resource: Resource, mut wanted: Decimal) {
        let elements = self.elements;
        let Some(x) = elements.get(customer).and_then(|e| e.state().as_exchanger()) else {
            return;
        };
        let mut suppliers: Vec<(Decimal, ElementId)> = x
            .book()
            .suppliers_of(resource)
            .into_iter()
            .filter(|&s| self.budget.contains_key(&(s, resource)))
            .map(|s| (self.unit_cost(s), s))
            .collect();
        suppliers.sort();

        for (_, supplier) in suppliers {
            let left = self.budget.entry((supplier, resource)).or_default();
            let take = wanted.min(*left).max(Decimal::ZERO);
            *left = left.saturating_sub(take);
            wanted = wanted.saturating_sub(take);
            self.rates.insert((supplier, customer, resource), take);
        }
    }

    /// Links ordered so that every link comes before the links feeding it.
    fn downstream_first(&self) -> Vec<(ElementId, Resource)> {
        let mut pending: Vec<(ElementId, Resource)> = self.links.iter().copied().collect();
        let mut order = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let ready: Vec<(ElementId, Resource)> = pending
                .iter()
                .copied()
                .filter(|&(link, resource)| {
                    self.link_customers(link, resource)
                        .into_iter()
                        .all(|c| !pending.contains(&(c, resource)))
                })
                .collect();
            if ready.is_empty() {
                // Links feeding one another in a ring; keep table order.
                order.append(&mut pending);
                break;
            }
            pending.retain(|entry| !ready.contains(entry));
            order.extend(ready);
        }
        order
    }

    fn link_customers(&self, link: ElementId, resource: Resource) -> Vec<ElementId> {
        self.elements
            .get(link)
            .and_then(|e| e.state().as_exchanger())
            .map(|x| {
                x.book()
                    .links()
                    .iter()
                    .filter(|l| l.role == ExchangeRole::Customer && l.resource == resource)
                    .map(|l| l.counterparty)
                    .filter(|&c| self.links.contains(&(c, resource)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total `link` now delivers of `resource`.
    fn outgoing(&self, link: ElementId, resource: Resource) -> Decimal {
        self.elements
            .get(link)
            .and_then(|e| e.state().as_exchanger())
            .map_or(Decimal::ZERO, |x| {
                x.book()
                    .counterparties(ExchangeRole::Customer)
                    .into_iter()
                    .fold(Decimal::ZERO, |acc, c| acc.saturating_add(self.rate(link, c, resource)))
            })
    }

    /// Rerouted rate if there is one, else the committed supply.
    fn rate(&self, supplier: ElementId, customer: ElementId, resource: Resource) -> Decimal {
        self.rates
            .get(&(supplier, customer, resource))
            .copied()
            .or_else(|| {
                self.elements
                    .get(supplier)
                    .and_then(|e| e.state().as_exchanger())
                    .map(|x| x.book().supply_to(customer).get(resource))
            })
            .unwrap_or_default()
    }

    fn unit_cost(&self, id: ElementId) -> Decimal {
        self.elements
            .get(id)
            .and_then(|e| e.state().unit_cost())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::SourceSpec;
    use crate::test_utils::*;
    use rust_decimal_macros::dec;

    #[test]
    fn idle_source_gives_its_share_to_the_dispatched_one() {
        let (mut b, west) = single_node_scenario();
        let cheap = b.add_element(water_source("cheap", west, dec!(100)));
        let dear = b.add_element(water_source("dear", west, dec!(100)));
        let town = b.add_element(water_consumer("town", west, dec!(10)));
        b.connect(cheap, town, Resource::Water).unwrap();
        b.connect(dear, town, Resource::Water).unwrap();
        let mut engine = engine_for(b.build());
        for _ in 0..6 {
            engine.micro_iteration().unwrap();
        }

        let problem = DispatchProblem {
            duration: dec!(1),
            sources: vec![
                SourceSpec {
                    element: cheap,
                    node: west,
                    resource: Resource::Water,
                    capacity: dec!(100),
                    cost: dec!(1),
                },
                SourceSpec {
                    element: dear,
                    node: west,
                    resource: Resource::Water,
                    capacity: dec!(100),
                    cost: dec!(5),
                },
            ],
            ..DispatchProblem::default()
        };
        let mut dispatch = Dispatch::default();
        dispatch.assign(cheap, Resource::Water, dec!(10));

        let rates: BTreeMap<_, _> = reroute_supply(engine.elements(), &problem, &dispatch)
            .into_iter()
            .collect();
        assert_eq!(rates[&(cheap, town, Resource::Water)], dec!(10));
        assert_eq!(rates[&(dear, town, Resource::Water)], dec!(0));
    }

    #[test]
    fn undispatched_suppliers_are_left_alone() {
        let (mut b, west) = single_node_scenario();
        let well = b.add_element(water_source("well", west, dec!(100)));
        let town = b.add_element(water_consumer("town", west, dec!(10)));
        b.connect(well, town, Resource::Water).unwrap();
        let mut engine = engine_for(b.build());
        for _ in 0..6 {
            engine.micro_iteration().unwrap();
        }

        let problem = DispatchProblem {
            duration: dec!(1),
            ..DispatchProblem::default()
        };
        assert!(reroute_supply(engine.elements(), &problem, &Dispatch::default()).is_empty());
    }
}
