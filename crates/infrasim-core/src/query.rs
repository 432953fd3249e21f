//! Read-only query API for inspecting simulation state.
//!
//! Snapshot types are owned copies with no references into engine storage,
//! suitable for handing to presentation or logging collaborators (and for
//! sending across threads).

use serde::{Deserialize, Serialize};

use crate::element::{Element, Flows};
use crate::engine::Engine;
use crate::id::{ElementId, StateId};
use crate::location::Location;
use crate::resource::ResourceVector;
use crate::state::LifecyclePhase;

/// An owned view of one element's committed attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementView {
    pub id: ElementId,
    pub name: String,
    pub location: Location,
    pub stock: ResourceVector,
    pub state: StateId,
    /// Variant name of the current state, e.g. `"producing"`.
    pub state_kind: String,
    pub phase: LifecyclePhase,
    pub parent: Option<ElementId>,
    /// Flows of the last committed tick.
    pub flows: Flows,
}

impl ElementView {
    pub fn of(element: &Element) -> Self {
        Self {
            id: element.id(),
            name: element.name().to_string(),
            location: element.location(),
            stock: element.stock(),
            state: element.state_id(),
            state_kind: element.state().kind_name().to_string(),
            phase: element.lifecycle_phase(),
            parent: element.parent(),
            flows: element.last_flows().clone(),
        }
    }
}

impl Engine {
    pub fn snapshot_element(&self, id: ElementId) -> Option<ElementView> {
        self.element(id).map(ElementView::of)
    }

    /// Views of every element, in table order.
    pub fn snapshot_all(&self) -> Vec<ElementView> {
        self.elements().values().map(ElementView::of).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use crate::test_utils::*;
    use rust_decimal_macros::dec;

    #[test]
    fn view_reflects_committed_state() {
        let (mut b, west) = single_node_scenario();
        let well = b.add_element(water_source("well", west, dec!(100)));
        let town = b.add_element(water_consumer("town", west, dec!(10)));
        b.connect(well, town, Resource::Water).unwrap();
        let mut engine = engine_for(b.build());
        engine.run(2).unwrap();

        let view = engine.snapshot_element(town).unwrap();
        assert_eq!(view.name, "town");
        assert_eq!(view.state_kind, "exchanging");
        assert_eq!(view.phase, LifecyclePhase::Operating);
        assert_eq!(view.flows.received.get(Resource::Water), dec!(10));
        assert_eq!(engine.snapshot_all().len(), 2);
    }

    #[test]
    fn missing_element_has_no_view() {
        let (b, _) = single_node_scenario();
        let engine = engine_for(b.build());
        assert!(engine.snapshot_element(ElementId::default()).is_none());
    }
}
