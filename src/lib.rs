//! Shard-aware CQL connection pool for ScyllaDB-compatible clusters.
//!
//! Nodes of such clusters are internally partitioned into fixed-size CPU
//! shards, and every partition token is owned by exactly one shard of each
//! replica. A driver which puts a request on a connection attached to the
//! owning shard saves the node an internal hop; this crate is the machinery
//! that makes that happen. It decides, maintains and repairs which TCP
//! connections exist to which shard of which node, and which connection
//! a given request rides on.
//!
//! The main entry point is [`ConnectionPool`](network::ConnectionPool): one
//! pool per node, created over a starter set of connections, keeping every
//! shard's connection count at its target in the background and dispatching
//! requests via
//! [`find_least_busy`](network::ConnectionPool::find_least_busy).
//!
//! What this crate deliberately does not do: statement preparation and
//! execution, CQL value codecs, load balancing across nodes, retries, or
//! topology discovery. Those live in the layers above, which use this crate
//! as their connection substrate.

pub mod cluster;
pub mod errors;
pub mod frame;
pub mod network;
pub mod observability;
pub mod policies;
pub mod routing;

mod utils;

pub use cluster::Host;
pub use network::{
    ConnectionPool, ConnectionPoolListener, PoolSettings, PooledConnection, VerifiedKeyspaceName,
};
pub use routing::Token;
