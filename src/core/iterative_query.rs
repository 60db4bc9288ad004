//! Iterative lookup: rounds of parallel requests walking the overlay
//! toward the nodes closest to a target id.

use std::collections::HashSet;
use std::net::SocketAddrV4;

use bytes::Bytes;
use tracing::debug;

use crate::common::messages::RequestSpecific;
use crate::common::{ClosestNodes, Id, Node};
use crate::rpc::socket::KrpcSocket;

/// Hard cap on lookup rounds. The id space is 160 bits deep, so any
/// honestly converging lookup finishes far earlier.
const MAX_ROUNDS: u16 = 160;

/// State of one iterative FIND_NODE or FIND_VALUE lookup.
///
/// Each round queries up to `alpha` of the closest not-yet-queried
/// candidates. A round ends when all its requests resolved. If the round
/// revealed a strictly closer candidate the lookup continues; otherwise it
/// converged, and one final round queries every remaining unqueried node
/// among the `k` closest before finishing.
#[derive(Debug)]
pub struct IterativeQuery {
    target: Id,
    request: RequestSpecific,
    k: usize,
    alpha: usize,

    candidates: ClosestNodes,
    responders: ClosestNodes,
    queried: HashSet<Id>,
    visited: HashSet<SocketAddrV4>,
    /// Outstanding transaction ids and, when known, who they went to.
    inflight: Vec<(u16, Option<Id>)>,

    round: u16,
    /// XOR distance of the closest candidate when the current round began.
    best_seen: Option<Id>,
    final_round: bool,

    value: Option<Bytes>,
    done: bool,
}

impl IterativeQuery {
    pub fn new(target: Id, request: RequestSpecific, k: usize, alpha: usize) -> Self {
        Self {
            target,
            request,
            k,
            alpha,
            candidates: ClosestNodes::new(target),
            responders: ClosestNodes::new(target),
            queried: HashSet::new(),
            visited: HashSet::new(),
            inflight: Vec::new(),
            round: 0,
            best_seen: None,
            final_round: false,
            value: None,
            done: false,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// The closest nodes that responded, the lookup's result.
    pub fn closest_responders(&self) -> Vec<Node> {
        self.responders.take(self.k)
    }

    pub fn inflight(&self, tid: u16) -> bool {
        self.inflight.iter().any(|(t, _)| *t == tid)
    }

    // === Public Methods ===

    /// Merge a candidate learned from a response or the routing table.
    pub fn add_candidate(&mut self, node: Node) {
        if self.queried.contains(node.id()) {
            return;
        }

        self.candidates.add(node);
    }

    /// Send the first round to the closest seed candidates.
    pub fn start(&mut self, socket: &mut KrpcSocket) {
        debug!(target = ?self.target, candidates = self.candidates.len(), "Starting lookup");

        self.best_seen = self.closest_candidate_distance();
        self.round = 1;
        self.dispatch(socket, self.alpha);
    }

    /// Query a bare address whose node id is not known yet, used for
    /// bootstrap seeds.
    pub fn visit(&mut self, socket: &mut KrpcSocket, address: SocketAddrV4) {
        if !self.visited.insert(address) {
            return;
        }

        let tid = socket.request(address, self.request.clone());
        self.inflight.push((tid, None));
    }

    /// A queried node responded; it joins the responders set and, with its
    /// confirmed identity, the candidates.
    pub fn success(&mut self, tid: u16, responder: Node) {
        self.inflight.retain(|(t, _)| *t != tid);

        self.queried.insert(*responder.id());
        self.candidates.add(responder.clone());
        self.responders.add(responder);
    }

    /// A request expired; the lookup drops the node. Returns the node's
    /// id, if the request was addressed to a known one.
    pub fn failure(&mut self, tid: u16) -> Option<Id> {
        let position = self.inflight.iter().position(|(t, _)| *t == tid)?;
        let (_, id) = self.inflight.remove(position);

        if let Some(id) = id {
            self.candidates.remove(&id);
        }

        id
    }

    /// The value this lookup was after turned up. The next tick finishes
    /// the lookup; requests still in the air expire in the socket.
    pub fn found_value(&mut self, value: Bytes) {
        if self.value.is_none() {
            self.value = Some(value);
        }
    }

    /// Advance the lookup at a round boundary. Returns `true` once done.
    pub fn tick(&mut self, socket: &mut KrpcSocket) -> bool {
        if self.done {
            return true;
        }

        if self.value.is_some() {
            self.done = true;

            return true;
        }

        // The current round still has requests in the air.
        if !self.inflight.is_empty() {
            return false;
        }

        let best = self.closest_candidate_distance();
        let improved = match (&best, &self.best_seen) {
            (Some(best), Some(seen)) => best < seen,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if improved && !self.final_round && self.round < MAX_ROUNDS {
            self.best_seen = best;
            self.round += 1;

            if self.dispatch(socket, self.alpha) > 0 {
                return false;
            }
        }

        if !self.final_round {
            // Converged. Sweep the remaining unqueried nodes among the k
            // closest so the result set is as complete as it can be.
            self.final_round = true;

            if self.dispatch(socket, self.k) > 0 {
                return false;
            }
        }

        debug!(
            target = ?self.target,
            rounds = self.round,
            responders = self.responders.len(),
            "Lookup finished"
        );

        self.done = true;

        true
    }

    // === Private Methods ===

    fn closest_candidate_distance(&self) -> Option<Id> {
        self.candidates
            .nodes()
            .first()
            .map(|node| node.id().xor(&self.target))
    }

    /// Query up to `max` of the closest unqueried candidates.
    fn dispatch(&mut self, socket: &mut KrpcSocket, max: usize) -> usize {
        let mut sent = 0;

        for node in self.candidates.take(self.k) {
            if sent >= max {
                break;
            }

            if self.queried.contains(node.id()) || self.visited.contains(&node.address()) {
                continue;
            }

            self.queried.insert(*node.id());
            self.visited.insert(node.address());

            let tid = socket.request(node.address(), self.request.clone());
            self.inflight.push((tid, Some(*node.id())));

            sent += 1;
        }

        sent
    }

    #[cfg(test)]
    fn inflight_tids(&self) -> Vec<u16> {
        self.inflight.iter().map(|(tid, _)| *tid).collect()
    }
}
