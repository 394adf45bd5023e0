use std::sync::atomic::{AtomicU64, Ordering};

const ORDER_TYPE: Ordering = Ordering::Relaxed;

/// Counters describing the state of the connection layer. One instance is
/// shared by all pools of a cluster.
#[derive(Debug, Default)]
pub struct Metrics {
    total_connections: AtomicU64,
    connection_timeouts: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub(crate) fn inc_total_connections(&self) {
        self.total_connections.fetch_add(1, ORDER_TYPE);
    }

    pub(crate) fn dec_total_connections(&self) {
        self.total_connections.fetch_sub(1, ORDER_TYPE);
    }

    pub(crate) fn inc_connection_timeouts(&self) {
        self.connection_timeouts.fetch_add(1, ORDER_TYPE);
    }

    /// Returns the number of currently live connections across all pools.
    pub fn get_total_connections(&self) -> u64 {
        self.total_connections.load(ORDER_TYPE)
    }

    /// Returns the number of connect attempts that timed out.
    pub fn get_connection_timeouts(&self) -> u64 {
        self.connection_timeouts.load(ORDER_TYPE)
    }
}
