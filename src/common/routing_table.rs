//! Kademlia routing table: one k-bucket per distance prefix.

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::slice::Iter;
use std::time::{Duration, Instant};

use crate::common::{ClosestNodes, Id, Node};

/// K = the default maximum size of a k-bucket, and the replication factor
/// for stored content.
pub const MAX_BUCKET_SIZE_K: usize = 20;
/// Consecutive failures before a contact is considered stale by default.
pub const DEFAULT_STALE_THRESHOLD: u8 = 3;

#[derive(Debug, Clone)]
/// Kademlia routing table: buckets keyed by their
/// [distance](Id::distance) (1..=160) to the local node's id.
pub struct RoutingTable {
    id: Id,
    buckets: BTreeMap<u8, KBucket>,
    k: usize,
    stale_threshold: u8,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            buckets: BTreeMap::new(),
            k: MAX_BUCKET_SIZE_K,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }

    // === Options ===

    pub fn with_bucket_size(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_stale_threshold(mut self, stale_threshold: u8) -> Self {
        self.stale_threshold = stale_threshold;
        self
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn bucket_size(&self) -> usize {
        self.k
    }

    pub fn stale_threshold(&self) -> u8 {
        self.stale_threshold
    }

    // === Public Methods ===

    /// Attempt to add a contact, or refresh it if already known, and return
    /// `true` if the table changed.
    ///
    /// A known contact is moved to the most-recently-seen end of its bucket,
    /// its failure counter reset and its address updated. A new contact is
    /// appended if the bucket has room; if the bucket is full it replaces the
    /// least-recently-seen contact only when that contact is stale, otherwise
    /// it is dropped (long-lived responsive contacts are protected).
    pub fn insert_or_touch(&mut self, node: Node) -> bool {
        let distance = self.id.distance(node.id());

        if distance == 0 {
            // Do not add self to the routing table
            return false;
        }

        let k = self.k;
        let stale_threshold = self.stale_threshold;

        self.buckets
            .entry(distance)
            .or_insert_with(KBucket::new)
            .insert_or_touch(node, k, stale_threshold)
    }

    /// Increment the failure counter of a contact after it failed to respond.
    /// Returns `true` if the contact is present.
    ///
    /// Failed contacts are not removed here; they are evicted either when a
    /// new contact wants their full bucket, or by the maintenance ping sweep
    /// once their failures reach the threshold.
    pub fn mark_stale(&mut self, node_id: &Id) -> bool {
        let distance = self.id.distance(node_id);

        self.buckets
            .get_mut(&distance)
            .map(|bucket| bucket.mark_stale(node_id))
            .unwrap_or(false)
    }

    /// Remove a contact from the table.
    pub fn remove(&mut self, node_id: &Id) {
        let distance = self.id.distance(node_id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.remove(node_id);
        }
    }

    /// Return up to `k` nodes sorted ascending by XOR distance to the target.
    ///
    /// Semantically a full scan; a contact is never ranked before a strictly
    /// closer one, regardless of which buckets they live in.
    pub fn closest(&self, target: &Id) -> Vec<Node> {
        let mut closest = ClosestNodes::new(*target);

        for bucket in self.buckets.values() {
            for node in bucket.iter() {
                closest.add(node.clone());
            }
        }

        closest.take(self.k)
    }

    /// Returns `true` if this routing table has no contacts.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.values().map(|bucket| bucket.len()).sum()
    }

    pub fn contains(&self, node_id: &Id) -> bool {
        let distance = self.id.distance(node_id);

        self.buckets
            .get(&distance)
            .map(|bucket| bucket.contains(node_id))
            .unwrap_or(false)
    }

    /// Iterate over all contacts in the table.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    /// Contacts whose consecutive failures reached the stale threshold,
    /// due to be purged.
    pub fn stale_nodes(&self) -> Vec<Id> {
        let threshold = self.stale_threshold;

        self.nodes()
            .filter(|node| node.is_stale(threshold))
            .map(|node| *node.id())
            .collect()
    }

    /// Addresses of contacts with no recorded failures whose last successful
    /// exchange is older than `age`, due for a liveness probe.
    pub fn nodes_to_ping(&self, age: Duration, now: Instant) -> Vec<(Id, SocketAddrV4)> {
        self.nodes()
            .filter(|node| node.failures() == 0 && node.not_seen_for(age, now))
            .map(|node| (*node.id(), node.address()))
            .collect()
    }

    /// Lookup targets for every bucket whose most recent successful contact
    /// is older than `interval`: a random id within the bucket's prefix range.
    pub fn refresh_targets(&self, interval: Duration, now: Instant) -> Vec<Id> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| {
                !bucket.is_empty() && now.duration_since(bucket.last_activity) >= interval
            })
            .map(|(distance, _)| self.id.random_at_distance(*distance))
            .collect()
    }

    /// Turn this routing table into a list of bootstrapping addresses,
    /// skipping contacts with recorded failures.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.nodes()
            .filter(|node| node.failures() == 0)
            .map(|node| node.address().to_string())
            .collect()
    }
}

/// Kbuckets are similar to LRU caches that evict unresponsive contacts,
/// without dropping any responsive contacts in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Nodes in the k-bucket, sorted by the least recently seen first.
    nodes: Vec<Node>,
    /// Last successful exchange with any contact routed to this bucket.
    last_activity: Instant,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            nodes: Vec::new(),
            last_activity: Instant::now(),
        }
    }

    // === Public Methods ===

    pub fn insert_or_touch(&mut self, incoming: Node, k: usize, stale_threshold: u8) -> bool {
        self.last_activity = Instant::now();

        if let Some(index) = self.iter().position(|n| n.id() == incoming.id()) {
            // Known contact: move to the most-recently-seen end, reset
            // failures, and take the latest address.
            let mut existing = self.nodes.remove(index);
            existing.touch();
            existing.update_address(incoming.address());
            self.nodes.push(existing);

            true
        } else if self.nodes.len() < k {
            self.nodes.push(incoming);

            true
        } else if self.nodes[0].is_stale(stale_threshold) {
            // Replace the least-recently-seen contact, which is already
            // past the failure threshold.
            self.nodes.remove(0);
            self.nodes.push(incoming);

            true
        } else {
            false
        }
    }

    pub fn mark_stale(&mut self, node_id: &Id) -> bool {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id() == node_id) {
            node.record_failure();

            return true;
        }

        false
    }

    pub fn remove(&mut self, node_id: &Id) {
        self.nodes.retain(|node| node.id() != node_id);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.iter().any(|node| node.id() == id)
    }

    pub fn iter(&self) -> Iter<'_, Node> {
        self.nodes.iter()
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;
    use std::str::FromStr;

    use super::*;

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random());
        assert!(table.is_empty());

        table.insert_or_touch(Node::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn contains_and_remove() {
        let mut table = RoutingTable::new(Id::random());
        let node = Node::random();

        assert!(!table.contains(node.id()));

        table.insert_or_touch(node.clone());
        assert!(table.contains(node.id()));

        table.remove(node.id());
        assert!(!table.contains(node.id()));
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(Id::random());

        let node1 = Node::random();
        let node2 = Node::new(*node1.id(), node1.address());

        table.insert_or_touch(node1);
        table.insert_or_touch(node2);

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn should_not_add_self() {
        let mut table = RoutingTable::new(Id::random());
        let node = Node::new(*table.id(), SocketAddrV4::new(0.into(), 0));

        assert!(!table.insert_or_touch(node));
        assert!(table.is_empty())
    }

    #[test]
    fn contacts_land_in_the_bucket_of_their_prefix() {
        let own_id = Id::random();
        let mut table = RoutingTable::new(own_id);

        for distance in [1_u8, 30, 80, 160] {
            let id = own_id.random_at_distance(distance);
            table.insert_or_touch(Node::new(id, SocketAddrV4::new(0.into(), 0)));

            let bucket = table.buckets.get(&distance).expect("bucket created");
            assert!(bucket.contains(&id));
        }
    }

    #[test]
    fn full_bucket_of_fresh_contacts_rejects_new_ones() {
        let own_id = Id::random();
        let mut table = RoutingTable::new(own_id);

        // All contacts at the same distance share a bucket.
        for _ in 0..MAX_BUCKET_SIZE_K {
            let id = own_id.random_at_distance(160);
            assert!(table.insert_or_touch(Node::new(id, SocketAddrV4::new(0.into(), 0))));
        }

        let before: Vec<Id> = table.nodes().map(|n| *n.id()).collect();

        let rejected = own_id.random_at_distance(160);
        assert!(!table.insert_or_touch(Node::new(rejected, SocketAddrV4::new(0.into(), 0))));

        let after: Vec<Id> = table.nodes().map(|n| *n.id()).collect();
        assert_eq!(before, after);
        assert_eq!(table.size(), MAX_BUCKET_SIZE_K);
    }

    #[test]
    fn full_bucket_evicts_a_stale_least_recently_seen_contact() {
        let own_id = Id::random();
        let mut table = RoutingTable::new(own_id).with_stale_threshold(2);

        let oldest = own_id.random_at_distance(160);
        table.insert_or_touch(Node::new(oldest, SocketAddrV4::new(0.into(), 0)));

        for _ in 1..MAX_BUCKET_SIZE_K {
            let id = own_id.random_at_distance(160);
            table.insert_or_touch(Node::new(id, SocketAddrV4::new(0.into(), 0)));
        }

        table.mark_stale(&oldest);
        table.mark_stale(&oldest);

        let incoming = own_id.random_at_distance(160);
        assert!(table.insert_or_touch(Node::new(incoming, SocketAddrV4::new(0.into(), 0))));

        assert!(!table.contains(&oldest));
        assert!(table.contains(&incoming));
        assert_eq!(table.size(), MAX_BUCKET_SIZE_K);
    }

    #[test]
    fn touch_resets_failures_and_moves_to_most_recent() {
        let own_id = Id::random();
        let mut table = RoutingTable::new(own_id);

        let node = Node::random();
        table.insert_or_touch(node.clone());
        table.mark_stale(node.id());

        assert_eq!(
            table.nodes().find(|n| n.id() == node.id()).map(Node::failures),
            Some(1)
        );

        table.insert_or_touch(node.clone());

        assert_eq!(
            table.nodes().find(|n| n.id() == node.id()).map(Node::failures),
            Some(0)
        );
    }

    #[test]
    fn stale_nodes_after_repeated_failures() {
        let mut table = RoutingTable::new(Id::random()).with_stale_threshold(3);
        let node = Node::random();

        table.insert_or_touch(node.clone());

        table.mark_stale(node.id());
        table.mark_stale(node.id());
        assert!(table.stale_nodes().is_empty());

        table.mark_stale(node.id());
        assert_eq!(table.stale_nodes(), vec![*node.id()]);
    }

    #[test]
    fn closest_is_sorted_and_bounded() {
        let local_id = Id::from_str("ba3042eb2d373b19e7c411ce6826e31b37be0b2e").expect("valid hex");
        let mut table = RoutingTable::new(local_id);

        for i in 0..100 {
            table.insert_or_touch(Node::unique(i + 1));
        }

        let target = Id::random();
        let closest = table.closest(&target);

        assert!(closest.len() <= MAX_BUCKET_SIZE_K);

        let distances: Vec<_> = closest.iter().map(|n| n.id().xor(&target)).collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(sorted, distances);

        // No node outside the result may be closer than any node inside it.
        if let Some(furthest) = distances.last() {
            for node in table.nodes() {
                if !closest.iter().any(|n| n.id() == node.id()) {
                    assert!(node.id().xor(&target) > *furthest);
                }
            }
        }
    }

    #[test]
    fn refresh_targets_only_for_quiet_buckets() {
        let own_id = Id::random();
        let mut table = RoutingTable::new(own_id);

        let id = own_id.random_at_distance(100);
        table.insert_or_touch(Node::new(id, SocketAddrV4::new(0.into(), 0)));

        let interval = Duration::from_secs(60);

        assert!(table.refresh_targets(interval, Instant::now()).is_empty());

        let future = Instant::now() + interval + Duration::from_secs(1);
        let targets = table.refresh_targets(interval, future);

        assert_eq!(targets.len(), 1);
        assert_eq!(own_id.distance(&targets[0]), 100);
    }
}
