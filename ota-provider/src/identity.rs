//! Requestor identity and admin selectors

use serde::{Deserialize, Serialize};

pub use ota_proto::{FabricIndex, NodeId, RequestorHeader};

/// Fabric-scoped identity of a requesting node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestorId {
    pub fabric_index: FabricIndex,
    pub node_id: NodeId,
}

impl RequestorId {
    pub fn new(fabric_index: FabricIndex, node_id: NodeId) -> Self {
        Self { fabric_index, node_id }
    }
}

impl From<RequestorHeader> for RequestorId {
    fn from(header: RequestorHeader) -> Self {
        Self::new(header.fabric_index, header.node_id)
    }
}

impl std::fmt::Display for RequestorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:016X}", self.fabric_index, self.node_id)
    }
}

/// Selects requestors for admin operations. `None` is a wildcard.
///
/// A concrete node id selects by node id alone; the fabric index is only
/// consulted when the node id is a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestorMatcher {
    pub fabric_index: Option<FabricIndex>,
    pub node_id: Option<NodeId>,
}

impl RequestorMatcher {
    /// Every requestor on every fabric
    pub fn any() -> Self {
        Self::default()
    }

    /// Every requestor on one fabric
    pub fn fabric(fabric_index: FabricIndex) -> Self {
        Self { fabric_index: Some(fabric_index), node_id: None }
    }

    pub fn requestor(id: RequestorId) -> Self {
        Self { fabric_index: Some(id.fabric_index), node_id: Some(id.node_id) }
    }

    pub fn matches(&self, id: &RequestorId) -> bool {
        match (self.fabric_index, self.node_id) {
            (_, Some(node_id)) => id.node_id == node_id,
            (Some(fabric_index), None) => id.fabric_index == fabric_index,
            (None, None) => true,
        }
    }
}

impl From<ota_proto::AdminTarget> for RequestorMatcher {
    fn from(target: ota_proto::AdminTarget) -> Self {
        Self { fabric_index: target.fabric_index, node_id: target.node_id }
    }
}

impl std::fmt::Display for RequestorMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.fabric_index {
            Some(fabric_index) => write!(f, "{fabric_index}:")?,
            None => f.write_str("*:")?,
        }
        match self.node_id {
            Some(node_id) => write!(f, "{node_id:016X}"),
            None => f.write_str("*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        let a = RequestorId::new(1, 0xAAAA);
        let b = RequestorId::new(2, 0xBBBB);

        assert!(RequestorMatcher::any().matches(&a));
        assert!(RequestorMatcher::any().matches(&b));

        assert!(RequestorMatcher::fabric(1).matches(&a));
        assert!(!RequestorMatcher::fabric(1).matches(&b));

        assert!(RequestorMatcher::requestor(a).matches(&a));
        assert!(!RequestorMatcher::requestor(a).matches(&b));
    }

    #[test]
    fn concrete_node_ignores_fabric() {
        let matcher = RequestorMatcher { fabric_index: Some(9), node_id: Some(0xAAAA) };
        assert!(matcher.matches(&RequestorId::new(1, 0xAAAA)));
    }

    #[test]
    fn display() {
        assert_eq!(RequestorId::new(1, 0xAAAA).to_string(), "1:000000000000AAAA");
        assert_eq!(RequestorMatcher::fabric(3).to_string(), "3:*");
        assert_eq!(RequestorMatcher::any().to_string(), "*:*");
    }
}
