//! Kadria: an iterative Kademlia DHT node.
//!
//! A self-organizing peer-to-peer overlay in which nodes locate each other
//! and store/retrieve key-addressed content using the XOR distance metric,
//! without any central coordinator.
//!
//! The crate runs a single actor thread owning the UDP socket, the k-bucket
//! routing table and the local content store. The [Dht] handle talks to that
//! thread over channels and exposes blocking `bootstrap`/`put`/`get`/`ping`
//! operations.

mod common;
mod core;
mod dht;
pub mod rpc;

pub use crate::common::messages;
pub use crate::common::{Id, Node, RoutingTable, ID_SIZE, MAX_DISTANCE};
pub use crate::core::config::Config;
pub use crate::core::put_query::PutError;
pub use crate::core::server::MAX_VALUE_SIZE;
pub use crate::core::statistics::{KindCounters, MessageCounters, MessageKind};
pub use crate::core::storage::StoredItem;
pub use crate::dht::{
    BootstrapError, Dht, DhtWasShutdown, GetError, Info, PublishError, Testnet,
};

pub use bytes::Bytes;
