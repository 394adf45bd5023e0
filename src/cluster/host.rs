use std::net::SocketAddr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::routing::ShardingInfo;

/// A single node of the cluster: its identity, its shard layout (once
/// learned from any connection to it) and its up/down status.
///
/// The pool never mutates a `Host`; the layers above (topology discovery,
/// the control connection) own its lifecycle.
#[derive(Debug)]
pub struct Host {
    /// Unique identifier of the node.
    pub host_id: Uuid,
    /// Address of the node, which is used to connect to it.
    pub address: SocketAddr,
    /// Datacenter of the node, if known.
    pub datacenter: Option<String>,
    /// Rack of the node, if known.
    pub rack: Option<String>,

    // Either the full, validated shard layout of the node, or nothing.
    // Partial descriptors never exist.
    sharding_info: RwLock<Option<ShardingInfo>>,

    is_up: AtomicBool,
}

impl Host {
    pub fn new(address: SocketAddr, datacenter: Option<String>, rack: Option<String>) -> Self {
        Self {
            host_id: Uuid::new_v4(),
            address,
            datacenter,
            rack,
            sharding_info: RwLock::new(None),
            is_up: AtomicBool::new(false),
        }
    }

    /// The node's shard layout, if it has been learned already.
    pub fn sharding_info(&self) -> Option<ShardingInfo> {
        self.sharding_info.read().unwrap().clone()
    }

    /// Records the shard layout learned from a connection to this node.
    /// The first recorded layout wins; a node never reshards within the
    /// lifetime of its `Host` record.
    pub fn set_sharding_info(&self, info: ShardingInfo) {
        let mut guard = self.sharding_info.write().unwrap();
        if guard.is_none() {
            *guard = Some(info);
        }
    }

    pub fn is_up(&self) -> bool {
        self.is_up.load(Ordering::Relaxed)
    }

    pub fn set_up(&self, up: bool) {
        self.is_up.store(up, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use super::Host;
    use crate::routing::ShardingInfo;
    use crate::utils::test_utils::setup_tracing;

    #[test]
    fn test_first_sharding_info_wins() {
        setup_tracing();
        let host = Host::new("127.0.0.1:9042".parse().unwrap(), None, None);
        assert!(host.sharding_info().is_none());

        let first = ShardingInfo::new(NonZeroU16::new(4).unwrap(), 12, Some(19042), None);
        host.set_sharding_info(first.clone());
        host.set_sharding_info(ShardingInfo::new(NonZeroU16::new(8).unwrap(), 10, None, None));

        assert_eq!(host.sharding_info(), Some(first));
    }
}
