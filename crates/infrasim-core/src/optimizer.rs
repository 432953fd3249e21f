//! Production/distribution dispatch contract.
//!
//! Once per macro tick the engine can hand a [`DispatchProblem`] to an
//! [`Optimizer`]: every source's capacity and cost, every link's capacity
//! and cost, and the demand at each node. The optimizer answers with a
//! quantity per element and resource, or an [`OptimizeError`]. Quantities
//! cover the whole tick; the engine divides by the tick duration to get
//! rates.
//!
//! When the optimizer fails, the engine keeps the previous tick's rates.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::id::{ElementId, NodeId};
use crate::resource::{Resource, ResourceVector, Time};

// ---------------------------------------------------------------------------
// Problem
// ---------------------------------------------------------------------------

/// A producing or retrieving element offering one resource at a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub element: ElementId,
    pub node: NodeId,
    pub resource: Resource,
    /// Most that can be delivered this tick.
    pub capacity: Decimal,
    /// Cost per unit delivered.
    pub cost: Decimal,
}

/// A distribution element carrying one resource from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub element: ElementId,
    pub from: NodeId,
    pub to: NodeId,
    pub resource: Resource,
    pub capacity: Decimal,
    pub cost: Decimal,
}

/// Quantity of a resource that must arrive at a node this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemandSpec {
    pub node: NodeId,
    pub resource: Resource,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchProblem {
    pub duration: Time,
    pub sources: Vec<SourceSpec>,
    pub links: Vec<LinkSpec>,
    pub demands: Vec<DemandSpec>,
}

impl DispatchProblem {
    pub fn total_demand(&self, resource: Resource) -> Decimal {
        self.demands
            .iter()
            .filter(|d| d.resource == resource)
            .fold(Decimal::ZERO, |acc, d| acc.saturating_add(d.amount))
    }

    pub fn total_capacity(&self, resource: Resource) -> Decimal {
        self.sources
            .iter()
            .filter(|s| s.resource == resource)
            .fold(Decimal::ZERO, |acc, s| acc.saturating_add(s.capacity))
    }

    /// Nodes mentioned anywhere in the problem, sorted.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .sources
            .iter()
            .map(|s| s.node)
            .chain(self.links.iter().flat_map(|l| [l.from, l.to]))
            .chain(self.demands.iter().map(|d| d.node))
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

// ---------------------------------------------------------------------------
// Answer
// ---------------------------------------------------------------------------

/// Assigned quantity per element and resource for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub assignments: BTreeMap<(ElementId, Resource), Decimal>,
}

impl Dispatch {
    pub fn assign(&mut self, element: ElementId, resource: Resource, quantity: Decimal) {
        let total = self.assignments.entry((element, resource)).or_default();
        *total = total.saturating_add(quantity);
    }

    /// Everything assigned to `element`, as a vector.
    pub fn assigned(&self, element: ElementId) -> ResourceVector {
        self.assignments
            .iter()
            .filter(|((e, _), _)| *e == element)
            .fold(ResourceVector::ZERO, |acc, ((_, r), q)| {
                acc.with(*r, acc.get(*r).saturating_add(*q))
            })
    }

    pub fn elements(&self) -> Vec<ElementId> {
        let mut out: Vec<ElementId> = self.assignments.keys().map(|(e, _)| *e).collect();
        out.dedup();
        out
    }
}

// ---------------------------------------------------------------------------
// Optimizer trait
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptimizeError {
    #[error("no feasible dispatch: {0}")]
    Infeasible(String),
    #[error("iteration budget of {0} exhausted")]
    IterationLimit(usize),
}

/// Assigns flow quantities that satisfy demand at least cost.
///
/// Called synchronously inside the macro tick, never concurrently with
/// element evaluation.
pub trait Optimizer: std::fmt::Debug + Send {
    fn name(&self) -> &str;

    fn optimize(&mut self, problem: &DispatchProblem) -> Result<Dispatch, OptimizeError>;
}
