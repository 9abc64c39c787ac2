//! DHT bootstrap module
//!
//! Crawl configuration and resolution of the well-known router nodes.

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dht::node::NodeId;

/// Routers used to enter the network
pub const DEFAULT_BOOTSTRAP_HOSTS: &[&str] = &[
    "router.utorrent.com",
    "router.bittorrent.com",
    "dht.transmissionbt.com",
    "router.bitcomet.com",
    "dht.aelitis.com",
];

pub const DEFAULT_DHT_PORT: u16 = 6881;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_WORKERS: usize = 100;
pub const DEFAULT_SCHEDULE_CAPACITY: usize = 10_000;
pub const DEFAULT_OUTPUT_CAPACITY: usize = 1_000_000;

/// Crawl configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Id sent in every query
    pub node_id: NodeId,
    pub bootstrap_hosts: Vec<String>,
    /// Port used for the bootstrap hosts
    pub port: u16,
    /// Deadline for each ping or get_peers exchange
    pub query_timeout: Duration,
    /// Concurrent get_peers probes
    pub workers: usize,
    /// Nodes waiting for a get_peers probe
    pub schedule_capacity: usize,
    /// Discovered contacts not yet consumed
    pub output_capacity: usize,
}

impl DhtConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            bootstrap_hosts: DEFAULT_BOOTSTRAP_HOSTS.iter().map(|h| h.to_string()).collect(),
            port: DEFAULT_DHT_PORT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            workers: DEFAULT_WORKERS,
            schedule_capacity: DEFAULT_SCHEDULE_CAPACITY,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self::new(NodeId::random())
    }
}

/// Resolve each host to its IPv4 addresses. Hosts that fail to resolve are
/// skipped.
pub async fn resolve_bootstrap_nodes(hosts: &[String], port: u16) -> Vec<SocketAddrV4> {
    let mut resolved = Vec::new();

    for host in hosts {
        match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(addrs) => {
                for addr in addrs {
                    match addr {
                        SocketAddr::V4(v4) => {
                            debug!("Resolved bootstrap node {} to {}", host, v4);
                            if !resolved.contains(&v4) {
                                resolved.push(v4);
                            }
                        }
                        SocketAddr::V6(v6) => debug!("Skipping IPv6 bootstrap node {}: {}", host, v6),
                    }
                }
            }
            Err(e) => warn!("Failed to resolve bootstrap node {}: {}", host, e),
        }
    }

    info!("Resolved {} bootstrap addresses from {} hosts", resolved.len(), hosts.len());
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = DhtConfig::new(NodeId::new([1; 20]));
        assert_eq!(config.port, 6881);
        assert_eq!(config.workers, 100);
        assert_eq!(config.schedule_capacity, 10_000);
        assert_eq!(config.output_capacity, 1_000_000);
        assert_eq!(config.query_timeout, Duration::from_secs(1));
        assert_eq!(config.bootstrap_hosts.len(), 5);
        assert_eq!(config.bootstrap_hosts[0], "router.utorrent.com");
    }

    #[tokio::test]
    async fn test_resolve_literal_addresses() {
        let hosts = vec!["127.0.0.1".to_string(), "127.0.0.1".to_string(), "::1".to_string()];
        let resolved = resolve_bootstrap_nodes(&hosts, 6881).await;
        assert_eq!(resolved, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_skipped() {
        let hosts = vec!["invalid host name".to_string(), "127.0.0.1".to_string()];
        let resolved = resolve_bootstrap_nodes(&hosts, 1).await;
        assert_eq!(resolved, vec!["127.0.0.1:1".parse().unwrap()]);
    }
}
