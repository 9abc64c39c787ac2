//! DHT node module
//!
//! Identifiers and contact records for nodes met during a crawl.

use std::fmt;
use std::net::SocketAddrV4;
use std::time::Instant;

/// DHT node identifier (20 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Create a new NodeId from bytes
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Generate a random NodeId
    pub fn random() -> Self {
        use rand::Rng;
        let mut id = [0u8; 20];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }

    /// Build a NodeId from a slice, which must be exactly 20 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a NodeId from a hex string
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        hex::decode(hex_str).ok().and_then(|bytes| Self::from_slice(&bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A node known to the crawler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtNode {
    pub addr: SocketAddrV4,
    /// Unknown until the node answers a ping or is listed by another node
    pub id: Option<NodeId>,
    /// Whether the node answered one of our pings
    pub pinged: bool,
    pub last_seen: Option<Instant>,
}

impl DhtNode {
    pub fn new(addr: SocketAddrV4) -> Self {
        Self {
            addr,
            id: None,
            pinged: false,
            last_seen: None,
        }
    }

    /// A node learned from a `nodes` list
    pub fn with_id(id: NodeId, addr: SocketAddrV4) -> Self {
        Self {
            id: Some(id),
            ..Self::new(addr)
        }
    }

    /// Record a ping answer
    pub fn mark_pinged(&mut self, id: NodeId) {
        self.id = Some(id);
        self.pinged = true;
        self.last_seen = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_random() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn test_node_id_hex() {
        let id = NodeId::new([0xAB; 20]);
        let hex_str = id.to_hex();
        assert_eq!(hex_str.len(), 40);
        assert_eq!(NodeId::from_hex(&hex_str), Some(id));
        assert_eq!(NodeId::from_hex("abcd"), None);
        assert_eq!(NodeId::from_hex("zz"), None);
    }

    #[test]
    fn test_from_slice_length() {
        assert!(NodeId::from_slice(&[1u8; 20]).is_some());
        assert!(NodeId::from_slice(&[1u8; 19]).is_none());
    }

    #[test]
    fn test_mark_pinged() {
        let mut node = DhtNode::new("10.0.0.1:6881".parse().unwrap());
        assert!(!node.pinged);
        assert!(node.id.is_none());

        node.mark_pinged(NodeId::new([7; 20]));
        assert!(node.pinged);
        assert_eq!(node.id, Some(NodeId::new([7; 20])));
        assert!(node.last_seen.is_some());
    }
}
