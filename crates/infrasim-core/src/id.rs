use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies an element in a scenario's element table.
    pub struct ElementId;
}

/// Identifies a node (a point in the infrastructure network). Cheap to copy
/// and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Identifies a state within one element's legal-state set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "state#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_equality() {
        assert_eq!(NodeId(0), NodeId(0));
        assert_ne!(NodeId(0), NodeId(1));
    }

    #[test]
    fn state_ids_order_numerically() {
        let mut ids = vec![StateId(3), StateId(0), StateId(2)];
        ids.sort();
        assert_eq!(ids, vec![StateId(0), StateId(2), StateId(3)]);
    }

    #[test]
    fn ids_display() {
        assert_eq!(NodeId(4).to_string(), "node#4");
        assert_eq!(StateId(1).to_string(), "state#1");
    }
}
