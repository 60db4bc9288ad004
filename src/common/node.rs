//! Struct and implementation of the Node entry in the Kademlia routing table
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::common::Id;

#[derive(Clone)]
/// Node entry in the Kademlia routing table: a peer's identity and address
/// plus the liveness bookkeeping mutated on every exchange with it.
pub struct Node {
    id: Id,
    address: SocketAddrV4,
    last_seen: Instant,
    failures: u8,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node {
            id,
            address,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    /// Consecutive failed exchanges since the last successful one.
    pub fn failures(&self) -> u8 {
        self.failures
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    // === Public Methods ===

    /// True once the node failed `threshold` consecutive exchanges, making it
    /// a candidate for eviction.
    pub fn is_stale(&self, threshold: u8) -> bool {
        self.failures >= threshold
    }

    /// True if the last successful exchange with this node is older than `age`.
    pub fn not_seen_for(&self, age: Duration, now: Instant) -> bool {
        now.duration_since(self.last_seen) >= age
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }

    pub(crate) fn update_address(&mut self, address: SocketAddrV4) {
        self.address = address;
    }

    pub(crate) fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    #[cfg(test)]
    pub fn random() -> Node {
        Node::new(Id::random(), SocketAddrV4::new([0, 0, 0, 0].into(), 0))
    }

    /// A deterministic node for tests, unique per `i`.
    #[cfg(test)]
    pub fn unique(i: usize) -> Node {
        let mut bytes = [0_u8; crate::common::ID_SIZE];
        bytes[..8].copy_from_slice(&(i as u64).to_be_bytes());

        Node::new(
            Id::from(bytes),
            SocketAddrV4::new((i as u32).into(), i as u16),
        )
    }
}

impl PartialEq for Node {
    /// Identity only; liveness bookkeeping does not affect equality.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("failures", &self.failures)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn touch_resets_failures() {
        let mut node = Node::random();

        node.record_failure();
        node.record_failure();
        assert_eq!(node.failures(), 2);
        assert!(node.is_stale(2));

        node.touch();
        assert_eq!(node.failures(), 0);
        assert!(!node.is_stale(2));
    }

    #[test]
    fn equality_ignores_liveness() {
        let node = Node::random();
        let mut copy = node.clone();

        copy.record_failure();

        assert_eq!(node, copy);
    }
}
