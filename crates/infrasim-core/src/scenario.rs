//! Scenario construction.
//!
//! A [`Scenario`] is the immutable starting point of a run: an initial time,
//! the node set, and the element table with every exchange link already
//! wired. The engine clones it and never mutates the original.

use crate::element::{ElementBuilder, ElementTable};
use crate::exchange::{ExchangeLink, ExchangeRole};
use crate::id::{ElementId, NodeId};
use crate::location::Node;
use crate::resource::{Resource, Time};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScenarioError {
    #[error("unknown element: {0:?}")]
    UnknownElement(ElementId),
    #[error("element '{0}' cannot link to itself")]
    SelfLink(String),
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub initial_time: Time,
    pub nodes: Vec<Node>,
    pub elements: ElementTable,
}

impl Scenario {
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up an element id by name.
    pub fn find(&self, name: &str) -> Option<ElementId> {
        self.elements
            .iter()
            .find(|(_, e)| e.name() == name)
            .map(|(id, _)| id)
    }
}

#[derive(Debug)]
pub struct ScenarioBuilder {
    initial_time: Time,
    nodes: Vec<Node>,
    elements: ElementTable,
}

impl ScenarioBuilder {
    pub fn new(initial_time: Time) -> Self {
        Self {
            initial_time,
            nodes: Vec::new(),
            elements: ElementTable::with_key(),
        }
    }

    /// Add a node. Ids are assigned in insertion order.
    pub fn add_node(&mut self, name: impl Into<String>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            name: name.into(),
        });
        id
    }

    pub fn add_element(&mut self, builder: ElementBuilder) -> ElementId {
        self.elements.insert_with_key(|id| builder.build(id))
    }

    /// Set an element's parent after both exist.
    pub fn nest(&mut self, child: ElementId, parent: ElementId) -> Result<(), ScenarioError> {
        if !self.elements.contains_key(parent) {
            return Err(ScenarioError::UnknownElement(parent));
        }
        let element = self
            .elements
            .get_mut(child)
            .ok_or(ScenarioError::UnknownElement(child))?;
        element.set_parent(parent);
        Ok(())
    }

    /// Wire `supplier` to deliver `resource` to `customer`. The link is added
    /// to every exchanging state of both elements.
    pub fn connect(
        &mut self,
        supplier: ElementId,
        customer: ElementId,
        resource: Resource,
    ) -> Result<(), ScenarioError> {
        if !self.elements.contains_key(customer) {
            return Err(ScenarioError::UnknownElement(customer));
        }
        let sup = self
            .elements
            .get_mut(supplier)
            .ok_or(ScenarioError::UnknownElement(supplier))?;
        if supplier == customer {
            return Err(ScenarioError::SelfLink(sup.name().to_string()));
        }
        sup.link(ExchangeLink {
            counterparty: customer,
            resource,
            role: ExchangeRole::Customer,
        });
        if let Some(cus) = self.elements.get_mut(customer) {
            cus.link(ExchangeLink {
                counterparty: supplier,
                resource,
                role: ExchangeRole::Supplier,
            });
        }
        Ok(())
    }

    pub fn build(self) -> Scenario {
        tracing::debug!(
            nodes = self.nodes.len(),
            elements = self.elements.len(),
            "scenario built"
        );
        Scenario {
            initial_time: self.initial_time,
            nodes: self.nodes,
            elements: self.elements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;
    use crate::location::Location;
    use crate::test_utils::*;
    use rust_decimal_macros::dec;

    #[test]
    fn connect_wires_both_sides() {
        let (mut b, west) = single_node_scenario();
        let well = b.add_element(water_source("well", west, dec!(5)));
        let town = b.add_element(water_consumer("town", west, dec!(1)));
        b.connect(well, town, Resource::Water).unwrap();
        let s = b.build();
        let w = s.elements[well].state().as_exchanger().unwrap().book().clone();
        let t = s.elements[town].state().as_exchanger().unwrap().book().clone();
        assert!(w.is_customer(town));
        assert!(t.is_supplier(well));
        assert_eq!(t.suppliers_of(Resource::Water), vec![well]);
    }

    #[test]
    fn connect_rejects_unknown_and_self() {
        let (mut b, west) = single_node_scenario();
        let well = b.add_element(water_source("well", west, dec!(5)));
        assert!(matches!(
            b.connect(well, ElementId::default(), Resource::Water),
            Err(ScenarioError::UnknownElement(_))
        ));
        assert!(matches!(
            b.connect(well, well, Resource::Water),
            Err(ScenarioError::SelfLink(_))
        ));
    }

    #[test]
    fn element_ids_match_table_keys() {
        let mut b = ScenarioBuilder::new(dec!(0));
        let n = b.add_node("only");
        let a = b.add_element(Element::builder("a", Location::nodal(n)));
        let c = b.add_element(Element::builder("c", Location::nodal(n)));
        b.nest(c, a).unwrap();
        let s = b.build();
        assert_eq!(s.elements[a].id(), a);
        assert_eq!(s.elements[c].parent(), Some(a));
        assert_eq!(s.find("c"), Some(c));
        assert_eq!(s.node(n).map(|n| n.name.as_str()), Some("only"));
    }
}
