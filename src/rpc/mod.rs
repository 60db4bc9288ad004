//! The protocol engine: a single-threaded event loop owning the socket,
//! the routing table, the content store and every running query.

pub mod socket;

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info};

use crate::common::messages::{
    Message, MessageType, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
    FindNodeRequestArguments, FindValueRequestArguments, StoreRequestArguments,
};
use crate::common::{Id, Node, RoutingTable};
use crate::core::config::Config;
use crate::core::iterative_query::IterativeQuery;
use crate::core::maintenance::{Decisions, Maintenance, SWEEP_INTERVAL};
use crate::core::put_query::{PutError, PutQuery};
use crate::core::server;
use crate::core::statistics::MessageCounters;
use crate::core::storage::{ContentStore, StoredItem};
use crate::dht::{BootstrapError, GetError};
use crate::rpc::socket::KrpcSocket;

/// Deferred work waiting on the lookup for the same target id.
pub enum Followup {
    /// Reply with the value the lookup found, if any.
    Get(flume::Sender<Result<Option<Bytes>, GetError>>),
    /// Reply with whether joining the overlay populated the routing table.
    Bootstrap(flume::Sender<Result<(), BootstrapError>>),
    /// Store the value on the closest nodes the lookup found. Republishes
    /// run without anyone waiting on the result.
    Put(
        StoreRequestArguments,
        Option<flume::Sender<Result<Id, PutError>>>,
    ),
}

struct PendingPing {
    node_id: Option<Id>,
    sender: Option<flume::Sender<Option<Id>>>,
}

pub struct Rpc {
    id: Id,
    config: Config,
    socket: KrpcSocket,

    routing_table: RoutingTable,
    store: ContentStore,

    queries: HashMap<Id, IterativeQuery>,
    put_queries: HashMap<Id, PutQuery>,
    followups: HashMap<Id, Vec<Followup>>,
    put_waiters: HashMap<Id, Vec<flume::Sender<Result<Id, PutError>>>>,
    pending_pings: HashMap<u16, PendingPing>,

    maintenance: Maintenance,
}

impl Rpc {
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        let id = Id::random();
        let socket = KrpcSocket::new(&config)?;

        info!(?id, address = ?socket.local_addr(), "Node starting");

        Ok(Self {
            id,
            routing_table: RoutingTable::new(id)
                .with_bucket_size(config.k)
                .with_stale_threshold(config.stale_threshold),
            store: ContentStore::new(config.max_stored_keys, config.content_ttl),
            queries: HashMap::new(),
            put_queries: HashMap::new(),
            followups: HashMap::new(),
            put_waiters: HashMap::new(),
            pending_pings: HashMap::new(),
            maintenance: Maintenance::new(SWEEP_INTERVAL),
            socket,
            config,
        })
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn stored_values(&self) -> usize {
        self.store.len()
    }

    pub fn counters(&self) -> MessageCounters {
        self.socket.counters
    }

    /// Addresses suitable for bootstrapping other nodes, falling back to
    /// the configured seeds while the routing table is still empty.
    pub fn to_bootstrap(&self) -> Vec<String> {
        if self.routing_table.is_empty() {
            self.config.bootstrap.clone()
        } else {
            self.routing_table.to_bootstrap()
        }
    }

    // === Public Methods ===

    /// One cycle of the event loop: receive a packet, expire requests,
    /// advance queries and run due maintenance.
    pub fn tick(&mut self) {
        if let Some((message, from)) = self.socket.recv_from() {
            match &message.message_type {
                MessageType::Request(request) => {
                    let request = request.clone();
                    self.handle_request(message.transaction_id, from, request);
                }
                _ => self.handle_response(message, from),
            }
        }

        for (tid, _, _) in self.socket.tick() {
            self.handle_timeout(tid);
        }

        let mut finished = Vec::new();
        for (target, query) in self.queries.iter_mut() {
            if query.tick(&mut self.socket) {
                finished.push(*target);
            }
        }
        for target in finished {
            if let Some(query) = self.queries.remove(&target) {
                self.finish_lookup(query);
            }
        }

        let mut finished_puts = Vec::new();
        for (key, put) in self.put_queries.iter_mut() {
            if let Some(result) = put.tick() {
                finished_puts.push((*key, result));
            }
        }
        for (key, result) in finished_puts {
            self.put_queries.remove(&key);

            for sender in self.put_waiters.remove(&key).unwrap_or_default() {
                let _ = sender.send(result.clone());
            }
        }

        let now = Instant::now();
        if let Some(decisions) =
            self.maintenance
                .tick(now, &self.config, &self.id, &self.routing_table, &self.store)
        {
            self.apply_maintenance(decisions, now);
        }
    }

    /// Join the overlay: look up our own id, seeded by the configured
    /// bootstrap addresses.
    pub fn bootstrap(&mut self, sender: Option<flume::Sender<Result<(), BootstrapError>>>) {
        self.start_lookup(
            self.id,
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target: self.id }),
            sender.map(Followup::Bootstrap),
            true,
        );
    }

    /// Retrieve a value by key, answering from the local store when we
    /// hold it ourselves.
    pub fn get(&mut self, key: Id, sender: flume::Sender<Result<Option<Bytes>, GetError>>) {
        if let Some(entry) = self.store.get(&key) {
            let _ = sender.send(Ok(Some(entry.value().clone())));

            return;
        }

        self.start_lookup(
            key,
            RequestTypeSpecific::FindValue(FindValueRequestArguments { key }),
            Some(Followup::Get(sender)),
            self.routing_table.is_empty(),
        );
    }

    /// Publish a value: store it locally, then replicate it to the k
    /// closest nodes a lookup finds.
    pub fn put(
        &mut self,
        arguments: StoreRequestArguments,
        sender: Option<flume::Sender<Result<Id, PutError>>>,
    ) {
        let key = arguments.key;

        self.store
            .put(key, arguments.value.clone(), arguments.owner);

        self.start_lookup(
            key,
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target: key }),
            Some(Followup::Put(arguments, sender)),
            self.routing_table.is_empty(),
        );
    }

    /// Probe a single address.
    pub fn ping(&mut self, address: SocketAddrV4, sender: Option<flume::Sender<Option<Id>>>) {
        let tid = self.socket.request(
            address,
            RequestSpecific {
                requester_id: self.id,
                request_type: RequestTypeSpecific::Ping,
            },
        );

        self.pending_pings
            .insert(tid, PendingPing { node_id: None, sender });
    }

    pub fn snapshot(&self) -> Vec<StoredItem> {
        self.store.snapshot(Instant::now())
    }

    pub fn restore(&mut self, items: Vec<StoredItem>) {
        self.store.restore(items, Instant::now());
    }

    // === Private Methods ===

    fn start_lookup(
        &mut self,
        target: Id,
        request_type: RequestTypeSpecific,
        followup: Option<Followup>,
        visit_bootstrap: bool,
    ) {
        if let Some(followup) = followup {
            self.followups.entry(target).or_default().push(followup);
        }

        if self.queries.contains_key(&target) {
            return;
        }

        let mut query = IterativeQuery::new(
            target,
            RequestSpecific {
                requester_id: self.id,
                request_type,
            },
            self.config.k,
            self.config.alpha,
        );

        for node in self.routing_table.closest(&target) {
            query.add_candidate(node);
        }

        if visit_bootstrap {
            for address in resolve(&self.config.bootstrap) {
                query.visit(&mut self.socket, address);
            }
        }

        query.start(&mut self.socket);
        self.queries.insert(target, query);
    }

    fn finish_lookup(&mut self, query: IterativeQuery) {
        let target = query.target();
        let value = query.value().cloned();
        let closest = query.closest_responders();

        for followup in self.followups.remove(&target).unwrap_or_default() {
            match followup {
                Followup::Get(sender) => {
                    // Nobody answered and nobody is known: the key was not
                    // searched, as opposed to searched and absent.
                    let result = if value.is_none()
                        && closest.is_empty()
                        && self.routing_table.is_empty()
                    {
                        Err(GetError::NoRoute)
                    } else {
                        Ok(value.clone())
                    };

                    let _ = sender.send(result);
                }
                Followup::Bootstrap(sender) => {
                    let result = if self.routing_table.is_empty() {
                        error!("Bootstrap yielded no nodes");

                        Err(BootstrapError::NoNodes)
                    } else {
                        info!(
                            nodes = self.routing_table.size(),
                            "Bootstrap complete"
                        );

                        Ok(())
                    };

                    let _ = sender.send(result);
                }
                Followup::Put(arguments, sender) => {
                    self.start_put(arguments, sender, &closest);
                }
            }
        }
    }

    fn start_put(
        &mut self,
        arguments: StoreRequestArguments,
        sender: Option<flume::Sender<Result<Id, PutError>>>,
        closest: &[Node],
    ) {
        let key = arguments.key;

        if let Some(sender) = sender {
            self.put_waiters.entry(key).or_default().push(sender);
        }

        if self.put_queries.contains_key(&key) {
            return;
        }

        let mut put = PutQuery::new(self.id, arguments);

        match put.start(&mut self.socket, closest) {
            Ok(()) => {
                self.put_queries.insert(key, put);
            }
            Err(put_error) => {
                for sender in self.put_waiters.remove(&key).unwrap_or_default() {
                    let _ = sender.send(Err(put_error.clone()));
                }
            }
        }
    }

    fn handle_request(&mut self, tid: u16, from: SocketAddrV4, request: RequestSpecific) {
        match server::handle_request(&self.id, &self.routing_table, &mut self.store, &request) {
            Ok(response) => self.socket.response(from, tid, response),
            Err(error) => self.socket.error(from, tid, error),
        }

        // Every inbound request is evidence of a live contact.
        self.routing_table
            .insert_or_touch(Node::new(request.requester_id, from));
    }

    fn handle_response(&mut self, message: Message, from: SocketAddrV4) {
        let tid = message.transaction_id;
        let author = message.get_author_id();

        if let Some(pending) = self.pending_pings.remove(&tid) {
            if let Some(author) = author {
                self.routing_table.insert_or_touch(Node::new(author, from));
            }

            if let Some(sender) = pending.sender {
                let _ = sender.send(author);
            }

            return;
        }

        if let Some(query) = self.queries.values_mut().find(|q| q.inflight(tid)) {
            match &message.message_type {
                MessageType::Response(response) => {
                    match response {
                        ResponseSpecific::FindValue(arguments) => {
                            // Only a value whose hash matches the looked up
                            // key is accepted.
                            if Id::hash(&arguments.value) == query.target() {
                                query.found_value(arguments.value.clone());
                            } else {
                                debug!(
                                    key = ?query.target(),
                                    ?from,
                                    "Dropping value that does not hash to its key"
                                );
                            }
                        }
                        ResponseSpecific::FindNode(arguments) => {
                            for node in &arguments.nodes {
                                if node.address().port() != 0 {
                                    query.add_candidate(node.clone());
                                }
                            }
                        }
                        ResponseSpecific::Pong(_) => {}
                    }

                    if let Some(author) = author {
                        let responder = Node::new(author, from);

                        query.success(tid, responder.clone());
                        self.routing_table.insert_or_touch(responder);
                    }
                }
                MessageType::Error(error) => {
                    debug!(?error, ?from, "Lookup request was rejected");

                    query.failure(tid);
                }
                MessageType::Request(_) => {}
            }

            return;
        }

        if let Some(put) = self.put_queries.values_mut().find(|p| p.inflight(tid)) {
            match &message.message_type {
                MessageType::Response(_) => {
                    put.success(tid);

                    if let Some(author) = author {
                        self.routing_table.insert_or_touch(Node::new(author, from));
                    }
                }
                MessageType::Error(error) => {
                    put.error(tid, error.clone());
                }
                MessageType::Request(_) => {}
            }
        }
    }

    fn handle_timeout(&mut self, tid: u16) {
        if let Some(pending) = self.pending_pings.remove(&tid) {
            if let Some(id) = pending.node_id {
                self.routing_table.mark_stale(&id);
            }

            if let Some(sender) = pending.sender {
                let _ = sender.send(None);
            }

            return;
        }

        if let Some(query) = self.queries.values_mut().find(|q| q.inflight(tid)) {
            if let Some(id) = query.failure(tid) {
                self.routing_table.mark_stale(&id);
            }

            return;
        }

        if let Some(put) = self.put_queries.values_mut().find(|p| p.inflight(tid)) {
            put.failure(tid);
        }
    }

    fn apply_maintenance(&mut self, decisions: Decisions, now: Instant) {
        if decisions.is_empty() {
            return;
        }

        debug!(
            refresh = decisions.refresh_targets.len(),
            purge = decisions.purge.len(),
            ping = decisions.ping.len(),
            expired = decisions.expired_keys.len(),
            republish = decisions.republish.len(),
            "Running maintenance"
        );

        for id in decisions.purge {
            self.routing_table.remove(&id);
        }

        for (id, address) in decisions.ping {
            let tid = self.socket.request(
                address,
                RequestSpecific {
                    requester_id: self.id,
                    request_type: RequestTypeSpecific::Ping,
                },
            );

            self.pending_pings.insert(
                tid,
                PendingPing {
                    node_id: Some(id),
                    sender: None,
                },
            );
        }

        for target in decisions.refresh_targets {
            self.start_lookup(
                target,
                RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
                None,
                false,
            );
        }

        for key in decisions.expired_keys {
            self.store.remove(&key);
        }

        for (key, value) in decisions.republish {
            self.store.mark_refreshed(&key, now);

            self.put(
                StoreRequestArguments {
                    key,
                    owner: self.id,
                    value,
                },
                None,
            );
        }
    }
}

fn resolve(addresses: &[String]) -> Vec<SocketAddrV4> {
    addresses
        .iter()
        .flat_map(|address| {
            address
                .to_socket_addrs()
                .map(|iter| iter.collect::<Vec<_>>())
                .unwrap_or_else(|error| {
                    debug!(?address, ?error, "Failed to resolve bootstrap address");

                    Vec::new()
                })
        })
        .filter_map(|address| match address {
            SocketAddr::V4(addr) => Some(addr),
            SocketAddr::V6(_) => None,
        })
        .collect()
}
