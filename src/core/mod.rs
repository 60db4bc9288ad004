//! Protocol logic driven by the actor: configuration, queries, storage and
//! periodic maintenance.

pub mod config;
pub mod iterative_query;
pub mod maintenance;
pub mod put_query;
pub mod server;
pub mod statistics;
pub mod storage;
