//! A set of nodes ordered by their XOR distance to a target.

use crate::common::{Id, Node};

/// The working set of currently-known-closest nodes during a lookup,
/// deduplicated by id and kept sorted ascending by distance to the target.
#[derive(Debug, Clone)]
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.nodes.iter().any(|node| node.id() == id)
    }

    // === Public Methods ===

    /// Insert a node at its distance rank. A node with an already known id is
    /// ignored, so merging replies is idempotent regardless of arrival order.
    pub fn add(&mut self, node: Node) {
        let seek = node.id().xor(&self.target);

        if let Err(pos) = self.nodes.binary_search_by(|probe| {
            if probe.id() == node.id() {
                std::cmp::Ordering::Equal
            } else {
                probe.id().xor(&self.target).cmp(&seek)
            }
        }) {
            self.nodes.insert(pos, node);
        }
    }

    /// Drop a node, typically after it failed to respond.
    pub fn remove(&mut self, id: &Id) {
        self.nodes.retain(|node| node.id() != id);
    }

    /// The closest `count` nodes seen so far.
    pub fn take(&self, count: usize) -> Vec<Node> {
        self.nodes[..count.min(self.nodes.len())].to_vec()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
