//! Infrasim Core -- the simulation kernel for interdependent infrastructure
//! networks.
//!
//! Elements (towns, utilities, power plants, pipelines) produce, store,
//! transport, and trade typed resources over discrete time. The kernel
//! resolves circular dependencies between elements inside one time step by
//! bounded micro-iteration and enforces that resources only move between
//! physically adjacent elements.
//!
//! # Macro tick
//!
//! Each call to [`engine::Engine::step`] advances the simulation by one tick:
//!
//! 1. **Micro-iterations** -- elements publish demand and supply to their
//!    counterparties, reading only committed values, for a fixed number of
//!    passes.
//! 2. **Dispatch** -- an [`optimizer::Optimizer`] (or demand-following)
//!    sets production and distribution rates. After an optimizer dispatch,
//!    [`reroute`] moves committed supply onto the dispatched suppliers.
//! 3. **Checks** -- node conservation and exchange symmetry, recorded as
//!    [`diagnostic::Diagnostic`]s.
//! 4. **Commit** -- every element computes its pending snapshot, then all
//!    commit together.
//!
//! # Key Types
//!
//! - [`resource::ResourceVector`] -- exact decimal quantity per resource.
//! - [`location::Location`] -- a node or a directed link between nodes.
//! - [`element::Element`] -- stock plus a legal-state set, double-buffered.
//! - [`state::State`] -- the state catalog and its capability traits.
//! - [`exchange::ExchangeBook`] -- per-counterparty demand and supply.
//! - [`scenario::ScenarioBuilder`] -- wires nodes, elements, and links.
//! - [`engine::Engine`] -- drives a scenario through macro ticks.

pub mod config;
pub mod diagnostic;
pub mod element;
pub mod engine;
pub mod exchange;
pub mod id;
pub mod location;
pub mod optimizer;
pub mod query;
pub mod reroute;
pub mod resource;
pub mod scenario;
pub mod sim;
pub mod staged;
pub mod state;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
