//! The public handle: a blocking API over a channel to the actor thread
//! that runs the protocol engine.

use std::net::SocketAddrV4;
use std::thread::JoinHandle;

use bytes::Bytes;
use tracing::info;

use crate::common::messages::StoreRequestArguments;
use crate::common::Id;
use crate::core::config::Config;
use crate::core::put_query::PutError;
use crate::core::server::MAX_VALUE_SIZE;
use crate::core::statistics::MessageCounters;
use crate::core::storage::StoredItem;
use crate::rpc::Rpc;

/// A running node.
///
/// Cheap to clone; all clones talk to the same actor thread. The thread
/// shuts down when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Dht {
    sender: flume::Sender<ActorMessage>,
}

enum ActorMessage {
    Bootstrap(flume::Sender<Result<(), BootstrapError>>),
    Put(Bytes, flume::Sender<Result<Id, PutError>>),
    Get(Id, flume::Sender<Result<Option<Bytes>, GetError>>),
    Ping(SocketAddrV4, flume::Sender<Option<Id>>),
    Info(flume::Sender<Info>),
    ToBootstrap(flume::Sender<Vec<String>>),
    Snapshot(flume::Sender<Vec<StoredItem>>),
    Restore(Vec<StoredItem>, flume::Sender<()>),
    Shutdown(flume::Sender<()>),
}

impl Dht {
    /// Create a node with the default [Config], binding an ephemeral port.
    pub fn new() -> Result<(Dht, JoinHandle<()>), std::io::Error> {
        Dht::with_config(Config::default())
    }

    /// Create a node, binding its socket on the calling thread so bind
    /// errors surface here, then spawn the actor thread.
    pub fn with_config(config: Config) -> Result<(Dht, JoinHandle<()>), std::io::Error> {
        let mut rpc = Rpc::new(config)?;

        let (sender, receiver) = flume::unbounded::<ActorMessage>();

        let handle = std::thread::spawn(move || loop {
            match receiver.try_recv() {
                Ok(ActorMessage::Shutdown(sender)) => {
                    info!("Node shutting down");
                    drop(receiver);
                    let _ = sender.send(());

                    break;
                }
                Ok(message) => handle_actor_message(&mut rpc, message),
                Err(flume::TryRecvError::Disconnected) => break,
                Err(flume::TryRecvError::Empty) => {}
            }

            rpc.tick();
        });

        Ok((Dht { sender }, handle))
    }

    // === Public Methods ===

    /// Join the overlay through the configured bootstrap addresses,
    /// blocking until the routing table is populated or every bootstrap
    /// node failed to answer.
    pub fn bootstrap(&self) -> Result<(), BootstrapError> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Bootstrap(sender))
            .map_err(|_| BootstrapError::Shutdown)?;

        receiver.recv().map_err(|_| BootstrapError::Shutdown)?
    }

    /// Publish a value to the overlay and return its content key.
    ///
    /// Blocks until at least one of the closest nodes acknowledged the
    /// value. The value also stays in the local store and is republished
    /// periodically.
    pub fn put(&self, value: Bytes) -> Result<Id, PublishError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(PublishError::ValueTooLarge(value.len()));
        }

        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Put(value, sender))
            .map_err(|_| PublishError::Shutdown)?;

        Ok(receiver.recv().map_err(|_| PublishError::Shutdown)??)
    }

    /// Retrieve a value by its content key, from the local store or the
    /// overlay.
    ///
    /// `Ok(None)` means the overlay was searched and nobody holds the key.
    /// A node with no contacts at all cannot search and fails with
    /// [GetError::NoRoute] instead.
    pub fn get(&self, key: Id) -> Result<Option<Bytes>, GetError> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Get(key, sender))
            .map_err(|_| GetError::Shutdown)?;

        receiver.recv().map_err(|_| GetError::Shutdown)?
    }

    /// Probe a single address, returning the node id it answered with.
    pub fn ping(&self, address: SocketAddrV4) -> Result<Option<Id>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Ping(address, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Addresses other nodes can bootstrap from, e.g. to persist for the
    /// next start.
    pub fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::ToBootstrap(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Portable snapshot of the content store, to persist across restarts.
    pub fn snapshot(&self) -> Result<Vec<StoredItem>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Snapshot(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Load a previously taken [snapshot](Dht::snapshot), dropping items
    /// whose time-to-live lapsed in the meantime.
    pub fn restore(&self, items: Vec<StoredItem>) -> Result<(), DhtWasShutdown> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Restore(items, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Stop the actor thread. Pending and future calls on any clone fail
    /// with a shutdown error.
    pub fn shutdown(&self) {
        let (sender, receiver) = flume::bounded(1);

        if self.sender.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv();
        }
    }
}

fn handle_actor_message(rpc: &mut Rpc, message: ActorMessage) {
    match message {
        ActorMessage::Bootstrap(sender) => {
            rpc.bootstrap(Some(sender));
        }
        ActorMessage::Put(value, sender) => {
            rpc.put(
                StoreRequestArguments {
                    key: Id::hash(&value),
                    owner: *rpc.id(),
                    value,
                },
                Some(sender),
            );
        }
        ActorMessage::Get(key, sender) => {
            rpc.get(key, sender);
        }
        ActorMessage::Ping(address, sender) => {
            rpc.ping(address, Some(sender));
        }
        ActorMessage::Info(sender) => {
            let _ = sender.send(Info {
                id: *rpc.id(),
                local_addr: rpc.local_addr(),
                routing_table_size: rpc.routing_table().size(),
                stored_values: rpc.stored_values(),
                counters: rpc.counters(),
            });
        }
        ActorMessage::ToBootstrap(sender) => {
            let _ = sender.send(rpc.to_bootstrap());
        }
        ActorMessage::Snapshot(sender) => {
            let _ = sender.send(rpc.snapshot());
        }
        ActorMessage::Restore(items, sender) => {
            rpc.restore(items);
            let _ = sender.send(());
        }
        ActorMessage::Shutdown(_) => {}
    }
}

/// A point-in-time view of a node's state.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddrV4,
    routing_table_size: usize,
    stored_values: usize,
    counters: MessageCounters,
}

impl Info {
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }

    pub fn stored_values(&self) -> usize {
        self.stored_values
    }

    pub fn counters(&self) -> &MessageCounters {
        &self.counters
    }
}

#[derive(thiserror::Error, Debug)]
#[error("The node was shut down")]
pub struct DhtWasShutdown;

#[derive(thiserror::Error, Debug)]
pub enum BootstrapError {
    #[error("Could not reach any bootstrap node")]
    NoNodes,

    #[error("The node was shut down")]
    Shutdown,
}

#[derive(thiserror::Error, Debug)]
pub enum GetError {
    #[error("No known contacts and no bootstrap node answered")]
    NoRoute,

    #[error("The node was shut down")]
    Shutdown,
}

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("Value of {0} bytes exceeds the maximum of {MAX_VALUE_SIZE}")]
    ValueTooLarge(usize),

    #[error(transparent)]
    Put(#[from] PutError),

    #[error("The node was shut down")]
    Shutdown,
}

/// A local overlay of nodes bootstrapped off each other, for tests.
pub struct Testnet {
    pub nodes: Vec<Dht>,
    handles: Vec<JoinHandle<()>>,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet, std::io::Error> {
        let mut nodes = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        let mut bootstrap = Vec::new();

        for i in 0..count {
            let config = Config {
                bootstrap: bootstrap.clone(),
                request_timeout: std::time::Duration::from_millis(100),
                ..Default::default()
            };

            let (node, handle) = Dht::with_config(config)?;

            if i == 0 {
                let info = node
                    .info()
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "node thread died"))?;

                bootstrap = vec![format!("127.0.0.1:{}", info.local_addr().port())];
            } else {
                node.bootstrap().map_err(|error| {
                    std::io::Error::new(std::io::ErrorKind::Other, error.to_string())
                })?;
            }

            nodes.push(node);
            handles.push(handle);
        }

        Ok(Testnet { nodes, handles })
    }
}

impl Drop for Testnet {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.shutdown();
        }

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
