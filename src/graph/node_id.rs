use std::num::NonZero;

/// ID of a node in a [`Graph`](crate::Graph).
///
/// IDs identify operators as well as the values and constants which they
/// consume and produce. IDs of removed nodes are not reused.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(NonZero<u32>);

impl NodeId {
    /// Return the underlying u32 value of the ID.
    pub fn as_u32(self) -> u32 {
        self.0.get() - 1
    }

    /// Return the underlying ID value as a usize, for slice indexing.
    pub fn as_usize(self) -> usize {
        self.as_u32() as usize
    }

    /// Construct a node ID from a u32 value.
    ///
    /// Panics if the value is `u32::MAX`.
    pub fn from_u32(value: u32) -> NodeId {
        // IDs are stored offset by one so that zero is available as a niche,
        // making `Option<NodeId>` the same size as `NodeId`.
        match value.checked_add(1).and_then(NonZero::new) {
            Some(id) => NodeId(id),
            None => panic!("node ID {} is out of range", value),
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_u32().fmt(f)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.as_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::NodeId;

    #[test]
    fn test_node_id() {
        let id = NodeId::from_u32(5);
        assert_eq!(id.as_u32(), 5);
        assert_eq!(id.as_usize(), 5);
        assert_eq!(id.to_string(), "5");
        assert_eq!(format!("{:?}", id), "NodeId(5)");
        assert_eq!(
            std::mem::size_of::<Option<NodeId>>(),
            std::mem::size_of::<NodeId>()
        );
    }
}
