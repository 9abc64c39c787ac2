//! Node registry
//!
//! Every node the crawl has heard of, keyed by node id behind a single
//! lock.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use tracing::trace;

use crate::dht::node::{DhtNode, NodeId};

/// Result of registering a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First time this id was seen
    Inserted,
    /// The id was known; its address was updated and `last_seen` bumped
    Refreshed,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<NodeId, DhtNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<NodeId, DhtNode>> {
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert the record for `id`, or refresh a known one. A refresh takes
    /// the new address and keeps the ping status only while the address is
    /// unchanged.
    pub fn register(&self, id: NodeId, mut node: DhtNode) -> Registration {
        match self.nodes().entry(id) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get();
                trace!("Refreshed node {} (was at {}, now {})", id, previous.addr, node.addr);
                node.pinged |= previous.pinged && previous.addr == node.addr;
                node.last_seen = Some(Instant::now());
                entry.insert(node);
                Registration::Refreshed
            }
            Entry::Vacant(entry) => {
                entry.insert(node);
                Registration::Inserted
            }
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<DhtNode> {
        self.nodes().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;
    use std::sync::Arc;

    #[test]
    fn test_duplicate_id_keeps_latest_address() {
        let registry = NodeRegistry::new();
        let id = NodeId::new([4; 20]);

        let first = registry.register(id, DhtNode::with_id(id, "10.0.0.1:6881".parse().unwrap()));
        let second = registry.register(id, DhtNode::with_id(id, "10.0.0.2:7000".parse().unwrap()));

        assert_eq!(first, Registration::Inserted);
        assert_eq!(second, Registration::Refreshed);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).unwrap().addr, "10.0.0.2:7000".parse().unwrap());
    }

    #[test]
    fn test_refresh_updates_last_seen() {
        let registry = NodeRegistry::new();
        let id = NodeId::new([5; 20]);
        let addr: SocketAddrV4 = "10.0.0.1:6881".parse().unwrap();

        let mut pinged = DhtNode::new(addr);
        pinged.mark_pinged(id);
        registry.register(id, pinged);
        let before = registry.get(&id).unwrap().last_seen.unwrap();

        assert_eq!(registry.register(id, DhtNode::with_id(id, addr)), Registration::Refreshed);
        let refreshed = registry.get(&id).unwrap();
        assert!(refreshed.pinged);
        assert!(refreshed.last_seen.unwrap() >= before);

        registry.register(id, DhtNode::with_id(id, "10.0.0.9:6881".parse().unwrap()));
        let moved = registry.get(&id).unwrap();
        assert!(!moved.pinged);
        assert!(moved.last_seen.is_some());
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(NodeRegistry::new());
        let threads: Vec<_> = (0..8u8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50u8 {
                        let id = NodeId::new([i; 20]);
                        registry.register(id, DhtNode::with_id(id, format!("10.0.{}.{}:1", t, i).parse().unwrap()));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(registry.len(), 50);
        assert!(!registry.is_empty());
    }
}
