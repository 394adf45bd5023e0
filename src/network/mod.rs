//! This module holds entities that represent connections to cluster nodes
//! and management over those connections (connection pooling).
//! This includes two main abstractions:
//! - Connection - a single connection to a node over the CQL protocol,
//! - ConnectionPool - a manager that keeps a desired number of connections
//!   opened to each shard of one node.

mod connection;
mod connection_pool;

pub use connection::{
    open_connection, Connection, ConnectionConfig, Credentials, ErrorReceiver, ResponseReceiver,
    TaskResponse, VerifiedKeyspaceName,
};
pub use connection_pool::{
    ConnectionPool, ConnectionPoolListener, PoolSettings, PooledConnection,
};
