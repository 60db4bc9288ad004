//! Replicating a value: STORE requests fanned out to the closest nodes
//! found by a preceding lookup.

use tracing::debug;

use crate::common::messages::{
    ErrorSpecific, RequestSpecific, RequestTypeSpecific, StoreRequestArguments,
};
use crate::common::{Id, Node};
use crate::rpc::socket::KrpcSocket;

#[derive(Debug)]
pub struct PutQuery {
    key: Id,
    requester_id: Id,
    arguments: StoreRequestArguments,
    inflight: Vec<u16>,
    confirmations: usize,
    errors: Vec<ErrorSpecific>,
    started: bool,
}

impl PutQuery {
    pub fn new(requester_id: Id, arguments: StoreRequestArguments) -> Self {
        Self {
            key: arguments.key,
            requester_id,
            arguments,
            inflight: Vec::new(),
            confirmations: 0,
            errors: Vec::new(),
            started: false,
        }
    }

    // === Getters ===

    pub fn key(&self) -> Id {
        self.key
    }

    pub fn inflight(&self, tid: u16) -> bool {
        self.inflight.iter().any(|t| *t == tid)
    }

    // === Public Methods ===

    /// Send the value to every node in the replication set.
    pub fn start(&mut self, socket: &mut KrpcSocket, nodes: &[Node]) -> Result<(), PutError> {
        self.started = true;

        if nodes.is_empty() {
            return Err(PutError::NoClosestNodes);
        }

        debug!(key = ?self.key, count = nodes.len(), "Storing value on closest nodes");

        for node in nodes {
            let tid = socket.request(
                node.address(),
                RequestSpecific {
                    requester_id: self.requester_id,
                    request_type: RequestTypeSpecific::Store(self.arguments.clone()),
                },
            );

            self.inflight.push(tid);
        }

        Ok(())
    }

    pub fn success(&mut self, tid: u16) {
        self.inflight.retain(|t| *t != tid);
        self.confirmations += 1;
    }

    pub fn failure(&mut self, tid: u16) {
        self.inflight.retain(|t| *t != tid);
    }

    pub fn error(&mut self, tid: u16, error: ErrorSpecific) {
        self.inflight.retain(|t| *t != tid);
        self.errors.push(error);
    }

    /// `Some` once every request resolved: the key if at least one node
    /// acknowledged the value, otherwise why the put failed.
    pub fn tick(&mut self) -> Option<Result<Id, PutError>> {
        if !self.started || !self.inflight.is_empty() {
            return None;
        }

        if self.confirmations > 0 {
            return Some(Ok(self.key));
        }

        Some(Err(match self.errors.pop() {
            Some(error) => PutError::Rejected(error),
            None => PutError::NoAcknowledgment,
        }))
    }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum PutError {
    #[error("The lookup found no nodes to store the value on")]
    NoClosestNodes,

    #[error("No node acknowledged the store request")]
    NoAcknowledgment,

    #[error("Nodes rejected the value: {} {}", .0.code, .0.description)]
    Rejected(ErrorSpecific),
}
