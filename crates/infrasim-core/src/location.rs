//! Node/link addressing used to validate the physical adjacency of flows.

use crate::id::NodeId;
use serde::{Deserialize, Serialize};

/// A named point in the infrastructure network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
}

/// Where an element sits: a single node (nodal) or a directed link from
/// `origin` to `destination`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub origin: NodeId,
    pub destination: NodeId,
}

impl Location {
    /// A location occupying a single node.
    pub fn nodal(node: NodeId) -> Self {
        Self {
            origin: node,
            destination: node,
        }
    }

    /// A directed link between two nodes.
    pub fn link(origin: NodeId, destination: NodeId) -> Self {
        Self {
            origin,
            destination,
        }
    }

    pub fn is_nodal(&self) -> bool {
        self.origin == self.destination
    }

    /// Whether either endpoint is `node`.
    pub fn touches(&self, node: NodeId) -> bool {
        self.origin == node || self.destination == node
    }

    /// Resources can flow from `self` into `next` only when `self` ends where
    /// `next` begins.
    pub fn feeds(&self, next: &Location) -> bool {
        self.destination == next.origin
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_nodal() {
            write!(f, "{}", self.origin)
        } else {
            write!(f, "{}->{}", self.origin, self.destination)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEST: NodeId = NodeId(0);
    const EAST: NodeId = NodeId(1);

    #[test]
    fn nodal_location_has_equal_endpoints() {
        let loc = Location::nodal(WEST);
        assert!(loc.is_nodal());
        assert_eq!(loc.origin, loc.destination);
    }

    #[test]
    fn link_is_directed() {
        let forward = Location::link(WEST, EAST);
        let backward = Location::link(EAST, WEST);
        assert!(!forward.is_nodal());
        assert_ne!(forward, backward);
    }

    #[test]
    fn structural_equality() {
        assert_eq!(Location::link(WEST, EAST), Location::link(WEST, EAST));
        assert_eq!(Location::nodal(EAST), Location::link(EAST, EAST));
    }

    #[test]
    fn feeds_requires_matching_endpoint() {
        let west = Location::nodal(WEST);
        let east = Location::nodal(EAST);
        let pipe = Location::link(WEST, EAST);
        assert!(west.feeds(&pipe));
        assert!(pipe.feeds(&east));
        assert!(!east.feeds(&pipe));
        assert!(!west.feeds(&east));
    }

    #[test]
    fn touches_either_endpoint() {
        let pipe = Location::link(WEST, EAST);
        assert!(pipe.touches(WEST));
        assert!(pipe.touches(EAST));
        assert!(!pipe.touches(NodeId(9)));
    }

    #[test]
    fn display_formats() {
        assert_eq!(Location::nodal(WEST).to_string(), "node#0");
        assert_eq!(Location::link(WEST, EAST).to_string(), "node#0->node#1");
    }
}
