//! Least-cost dispatch for the Infrasim engine.
//!
//! [`MinCostFlowOptimizer`] solves each tick's [`DispatchProblem`] as one
//! min-cost flow per resource:
//!
//! ```text
//!   source ──(capacity, unit cost)──▶ node ──(link capacity, cost)──▶ node ──(demand)──▶ sink
//! ```
//!
//! Flow is pushed along successive shortest paths (Bellman-Ford over the
//! residual graph, so negative residual costs are fine) until every demand
//! edge is saturated or no augmenting path remains. The flow on each source
//! and link edge becomes that element's assignment.
//!
//! # Design
//!
//! - Resources are solved independently; a source never trades one
//!   resource for another inside the optimizer.
//! - Link losses are not modelled. A lossy link is dispatched at the
//!   quantity that leaves its origin.
//! - Ties between equal-cost paths resolve by insertion order, which is the
//!   problem's listing order. Results are deterministic.

use std::collections::{BTreeMap, BTreeSet};

use infrasim_core::id::{ElementId, NodeId};
use infrasim_core::optimizer::{Dispatch, DispatchProblem, OptimizeError, Optimizer};
use infrasim_core::resource::Resource;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinCostFlowConfig {
    /// Augmenting paths allowed per call, across all resources.
    pub max_augmentations: usize,
    /// Return a partial dispatch instead of failing when demand cannot be
    /// met in full.
    pub allow_shortfall: bool,
}

impl Default for MinCostFlowConfig {
    fn default() -> Self {
        Self {
            max_augmentations: 10_000,
            allow_shortfall: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Residual graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Edge {
    to: usize,
    capacity: Decimal,
    flow: Decimal,
    cost: Decimal,
    /// Element whose assignment this edge carries. Reverse and demand edges
    /// have none.
    owner: Option<ElementId>,
}

impl Edge {
    fn residual(&self) -> Decimal {
        self.capacity - self.flow
    }
}

/// Edges are stored in pairs; `e ^ 1` is the reverse of `e`.
#[derive(Debug)]
struct FlowGraph {
    edges: Vec<Edge>,
    adjacency: Vec<Vec<usize>>,
}

impl FlowGraph {
    fn new(vertices: usize) -> Self {
        Self {
            edges: Vec::new(),
            adjacency: vec![Vec::new(); vertices],
        }
    }

    fn add_edge(&mut self, from: usize, to: usize, capacity: Decimal, cost: Decimal, owner: Option<ElementId>) {
        self.adjacency[from].push(self.edges.len());
        self.edges.push(Edge {
            to,
            capacity,
            flow: Decimal::ZERO,
            cost,
            owner,
        });
        self.adjacency[to].push(self.edges.len());
        self.edges.push(Edge {
            to: from,
            capacity: Decimal::ZERO,
            flow: Decimal::ZERO,
            cost: -cost,
            owner: None,
        });
    }

    /// Cheapest path from `source` to `sink` in the residual graph, as the
    /// list of edge indices leading into each vertex.
    fn shortest_path(&self, source: usize, sink: usize) -> Option<Vec<usize>> {
        let n = self.adjacency.len();
        let mut dist: Vec<Option<Decimal>> = vec![None; n];
        let mut via: Vec<Option<usize>> = vec![None; n];
        dist[source] = Some(Decimal::ZERO);

        for _ in 1..n {
            let mut changed = false;
            for from in 0..n {
                let Some(d) = dist[from] else { continue };
                for &e in &self.adjacency[from] {
                    let edge = &self.edges[e];
                    if edge.residual() <= Decimal::ZERO {
                        continue;
                    }
                    let candidate = d + edge.cost;
                    if dist[edge.to].is_none_or(|current| candidate < current) {
                        dist[edge.to] = Some(candidate);
                        via[edge.to] = Some(e);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        dist[sink]?;
        let mut path = Vec::new();
        let mut v = sink;
        while v != source {
            let e = via[v]?;
            path.push(e);
            v = self.edges[e ^ 1].to;
        }
        path.reverse();
        Some(path)
    }

    fn augment(&mut self, path: &[usize]) -> Decimal {
        let bottleneck = path
            .iter()
            .map(|&e| self.edges[e].residual())
            .min()
            .unwrap_or_default();
        for &e in path {
            self.edges[e].flow += bottleneck;
            self.edges[e ^ 1].flow -= bottleneck;
        }
        bottleneck
    }
}

// ---------------------------------------------------------------------------
// Optimizer
// ---------------------------------------------------------------------------

/// Successive-shortest-path min-cost flow dispatcher.
#[derive(Debug, Clone, Default)]
pub struct MinCostFlowOptimizer {
    pub config: MinCostFlowConfig,
}

impl MinCostFlowOptimizer {
    pub fn new(config: MinCostFlowConfig) -> Self {
        Self { config }
    }

    /// Solve one resource, adding its assignments to `dispatch`. Returns the
    /// delivered quantity.
    fn solve_resource(
        &self,
        problem: &DispatchProblem,
        resource: Resource,
        budget: &mut usize,
        dispatch: &mut Dispatch,
    ) -> Result<Decimal, OptimizeError> {
        let index: BTreeMap<NodeId, usize> = problem
            .nodes()
            .into_iter()
            .enumerate()
            .map(|(i, node)| (node, i + 2))
            .collect();
        let (source, sink) = (0, 1);
        let mut graph = FlowGraph::new(index.len() + 2);

        for s in problem.sources.iter().filter(|s| s.resource == resource) {
            graph.add_edge(source, index[&s.node], s.capacity, s.cost, Some(s.element));
        }
        for l in problem.links.iter().filter(|l| l.resource == resource) {
            graph.add_edge(index[&l.from], index[&l.to], l.capacity, l.cost, Some(l.element));
        }
        for d in problem.demands.iter().filter(|d| d.resource == resource) {
            graph.add_edge(index[&d.node], sink, d.amount, Decimal::ZERO, None);
        }

        let mut delivered = Decimal::ZERO;
        while let Some(path) = graph.shortest_path(source, sink) {
            if *budget == 0 {
                return Err(OptimizeError::IterationLimit(self.config.max_augmentations));
            }
            *budget -= 1;
            let pushed = graph.augment(&path);
            if pushed <= Decimal::ZERO {
                break;
            }
            delivered += pushed;
        }

        for edge in &graph.edges {
            if let Some(owner) = edge.owner {
                if edge.flow > Decimal::ZERO {
                    dispatch.assign(owner, resource, edge.flow);
                }
            }
        }
        Ok(delivered)
    }
}

impl Optimizer for MinCostFlowOptimizer {
    fn name(&self) -> &str {
        "min-cost-flow"
    }

    fn optimize(&mut self, problem: &DispatchProblem) -> Result<Dispatch, OptimizeError> {
        let resources: BTreeSet<Resource> = problem
            .demands
            .iter()
            .filter(|d| d.amount > Decimal::ZERO)
            .map(|d| d.resource)
            .collect();

        let mut dispatch = Dispatch::default();
        let mut budget = self.config.max_augmentations;
        for resource in resources {
            let wanted = problem.total_demand(resource);
            let delivered = self.solve_resource(problem, resource, &mut budget, &mut dispatch)?;
            if delivered < wanted {
                let shortfall = wanted - delivered;
                if !self.config.allow_shortfall {
                    return Err(OptimizeError::Infeasible(format!(
                        "{}: {shortfall} of {wanted} cannot be delivered",
                        resource.name()
                    )));
                }
                tracing::debug!(resource = resource.name(), %shortfall, "partial dispatch");
            }
        }
        tracing::trace!(
            assignments = dispatch.assignments.len(),
            augmentations = self.config.max_augmentations - budget,
            "dispatch solved"
        );
        Ok(dispatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infrasim_core::optimizer::{DemandSpec, LinkSpec, SourceSpec};
    use rust_decimal_macros::dec;
    use slotmap::SlotMap;

    fn ids(n: usize) -> Vec<ElementId> {
        let mut map: SlotMap<ElementId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    fn source(element: ElementId, node: u32, capacity: Decimal, cost: Decimal) -> SourceSpec {
        SourceSpec {
            element,
            node: NodeId(node),
            resource: Resource::Water,
            capacity,
            cost,
        }
    }

    fn demand(node: u32, amount: Decimal) -> DemandSpec {
        DemandSpec {
            node: NodeId(node),
            resource: Resource::Water,
            amount,
        }
    }

    fn problem(sources: Vec<SourceSpec>, links: Vec<LinkSpec>, demands: Vec<DemandSpec>) -> DispatchProblem {
        DispatchProblem {
            duration: dec!(1),
            sources,
            links,
            demands,
        }
    }

    fn water(dispatch: &Dispatch, element: ElementId) -> Decimal {
        dispatch.assigned(element).get(Resource::Water)
    }

    #[test]
    fn cheapest_source_used_first() {
        let e = ids(2);
        let p = problem(
            vec![source(e[0], 0, dec!(10), dec!(2)), source(e[1], 0, dec!(10), dec!(1))],
            vec![],
            vec![demand(0, dec!(15))],
        );
        let dispatch = MinCostFlowOptimizer::default().optimize(&p).unwrap();
        assert_eq!(water(&dispatch, e[1]), dec!(10));
        assert_eq!(water(&dispatch, e[0]), dec!(5));
    }

    #[test]
    fn remote_demand_flows_over_link() {
        let e = ids(2);
        let link = LinkSpec {
            element: e[1],
            from: NodeId(0),
            to: NodeId(1),
            resource: Resource::Water,
            capacity: dec!(10),
            cost: dec!(1),
        };
        let p = problem(vec![source(e[0], 0, dec!(20), dec!(1))], vec![link], vec![demand(1, dec!(5))]);
        let dispatch = MinCostFlowOptimizer::default().optimize(&p).unwrap();
        assert_eq!(water(&dispatch, e[0]), dec!(5));
        assert_eq!(water(&dispatch, e[1]), dec!(5));
    }

    #[test]
    fn cheaper_import_beats_expensive_local() {
        let e = ids(3);
        let link = LinkSpec {
            element: e[2],
            from: NodeId(0),
            to: NodeId(1),
            resource: Resource::Water,
            capacity: dec!(4),
            cost: dec!(1),
        };
        let p = problem(
            vec![source(e[0], 0, dec!(20), dec!(1)), source(e[1], 1, dec!(20), dec!(5))],
            vec![link],
            vec![demand(1, dec!(10))],
        );
        let dispatch = MinCostFlowOptimizer::default().optimize(&p).unwrap();
        assert_eq!(water(&dispatch, e[2]), dec!(4));
        assert_eq!(water(&dispatch, e[0]), dec!(4));
        assert_eq!(water(&dispatch, e[1]), dec!(6));
    }

    #[test]
    fn link_bottleneck_is_infeasible() {
        let e = ids(2);
        let link = LinkSpec {
            element: e[1],
            from: NodeId(0),
            to: NodeId(1),
            resource: Resource::Water,
            capacity: dec!(3),
            cost: dec!(0),
        };
        let p = problem(vec![source(e[0], 0, dec!(20), dec!(1))], vec![link], vec![demand(1, dec!(5))]);
        let err = MinCostFlowOptimizer::default().optimize(&p).unwrap_err();
        assert!(matches!(err, OptimizeError::Infeasible(_)));
    }

    #[test]
    fn shortfall_allowed_returns_partial_dispatch() {
        let e = ids(1);
        let p = problem(vec![source(e[0], 0, dec!(3), dec!(1))], vec![], vec![demand(0, dec!(5))]);
        let mut optimizer = MinCostFlowOptimizer::new(MinCostFlowConfig {
            allow_shortfall: true,
            ..MinCostFlowConfig::default()
        });
        let dispatch = optimizer.optimize(&p).unwrap();
        assert_eq!(water(&dispatch, e[0]), dec!(3));
    }

    #[test]
    fn augmentation_budget_enforced() {
        let e = ids(2);
        let p = problem(
            vec![source(e[0], 0, dec!(1), dec!(1)), source(e[1], 0, dec!(1), dec!(2))],
            vec![],
            vec![demand(0, dec!(2))],
        );
        let mut optimizer = MinCostFlowOptimizer::new(MinCostFlowConfig {
            max_augmentations: 1,
            ..MinCostFlowConfig::default()
        });
        assert_eq!(optimizer.optimize(&p), Err(OptimizeError::IterationLimit(1)));
    }

    #[test]
    fn no_demand_assigns_nothing() {
        let e = ids(1);
        let p = problem(vec![source(e[0], 0, dec!(10), dec!(1))], vec![], vec![]);
        let dispatch = MinCostFlowOptimizer::default().optimize(&p).unwrap();
        assert!(dispatch.assignments.is_empty());
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: MinCostFlowConfig = serde_json::from_str(r#"{"allow_shortfall": true}"#).unwrap();
        assert!(config.allow_shortfall);
        assert_eq!(config.max_augmentations, 10_000);
    }
}
