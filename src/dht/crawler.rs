//! DHT crawler
//!
//! Recursive `get_peers` discovery. Nodes answering a bootstrap ping seed a
//! scheduling queue; a fixed pool of workers probes each scheduled node,
//! forwards returned peer contacts to the output stream and feeds newly
//! listed node ids back into the queue. The crawl runs until its task is
//! aborted.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::dht::bootstrap::{resolve_bootstrap_nodes, DhtConfig};
use crate::dht::message::{generate_transaction_id, get_peers_query, parse_response, ping_query, KrpcResponse};
use crate::dht::node::{DhtNode, NodeId};
use crate::dht::registry::{NodeRegistry, Registration};
use crate::error::TorrentError;

/// Largest reply read from a node
const MAX_DATAGRAM: usize = 2048;

pub struct DhtCrawler {
    info_hash: [u8; 20],
    config: DhtConfig,
    registry: NodeRegistry,
    schedule_tx: mpsc::Sender<DhtNode>,
    schedule_rx: Mutex<Option<mpsc::Receiver<DhtNode>>>,
    output: mpsc::Sender<SocketAddrV4>,
    workers: Arc<Semaphore>,
    dropped: AtomicUsize,
}

impl DhtCrawler {
    /// Create a crawler for `info_hash` and the stream its contacts are
    /// delivered on
    pub fn new(info_hash: [u8; 20], config: DhtConfig) -> (Arc<Self>, mpsc::Receiver<SocketAddrV4>) {
        let (schedule_tx, schedule_rx) = mpsc::channel(config.schedule_capacity.max(1));
        let (output, contacts) = mpsc::channel(config.output_capacity.max(1));
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));

        info!(
            "DHT crawler for {} with node id {}, {} workers",
            hex::encode(info_hash),
            config.node_id,
            config.workers
        );

        let crawler = Arc::new(Self {
            info_hash,
            config,
            registry: NodeRegistry::new(),
            schedule_tx,
            schedule_rx: Mutex::new(Some(schedule_rx)),
            output,
            workers,
            dropped: AtomicUsize::new(0),
        });
        (crawler, contacts)
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }

    /// Candidates discarded because the scheduling queue was saturated
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Start the worker pool and bootstrap from the configured routers.
    ///
    /// The returned task never finishes on its own; abort it to stop the
    /// crawl.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let schedule = self
            .schedule_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| TorrentError::dht_error("Crawler already started"))?;

        let crawler = self.clone();
        let handle = tokio::spawn(async move {
            let bootstrap = crawler.clone();
            tokio::spawn(async move {
                bootstrap.bootstrap().await;
            });
            crawler.process_nodes(schedule).await;
        });
        Ok(handle)
    }

    /// Resolve the bootstrap hosts and ping each address
    pub async fn bootstrap(self: &Arc<Self>) -> usize {
        info!("Bootstrapping DHT crawl");
        let addrs = resolve_bootstrap_nodes(&self.config.bootstrap_hosts, self.config.port).await;
        for addr in &addrs {
            self.add_node(*addr);
        }
        addrs.len()
    }

    /// Ping `addr` on a new task and register it if it answers
    pub fn add_node(self: &Arc<Self>, addr: SocketAddrV4) -> JoinHandle<()> {
        let crawler = self.clone();
        tokio::spawn(async move {
            match crawler.ping(addr).await {
                Ok(id) => {
                    info!("Contacted DHT node {} ({})", addr, id);
                    let mut node = DhtNode::new(addr);
                    node.mark_pinged(id);
                    crawler.discover(id, node);
                }
                Err(e) => warn!("Could not contact DHT node {}: {}", addr, e),
            }
        })
    }

    async fn process_nodes(self: Arc<Self>, mut schedule: mpsc::Receiver<DhtNode>) {
        debug!("Processing scheduled DHT nodes");
        while let Some(node) = schedule.recv().await {
            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let crawler = self.clone();
            tokio::spawn(async move {
                crawler.probe(node).await;
                drop(permit);
            });
        }
    }

    /// Query the node at its latest registered address
    async fn probe(&self, node: DhtNode) {
        let addr = node
            .id
            .and_then(|id| self.registry.get(&id))
            .map_or(node.addr, |current| current.addr);
        match self.get_peers(addr).await {
            Ok(response) => self.absorb(response).await,
            Err(e) => debug!("get_peers to {} yielded nothing: {}", addr, e),
        }
    }

    /// Send `ping` and return the responder's id
    pub async fn ping(&self, addr: SocketAddrV4) -> Result<NodeId> {
        let transaction_id = generate_transaction_id();
        let query = ping_query(&transaction_id, &self.config.node_id)?;
        let reply = self.exchange(addr, &query).await?;
        let response = parse_response(&reply, &transaction_id)?;
        let id = response
            .id
            .ok_or_else(|| TorrentError::dht_error_with_node("Ping reply without node id", addr.to_string()))?;
        Ok(id)
    }

    /// Send `get_peers` for the crawled info hash
    pub async fn get_peers(&self, addr: SocketAddrV4) -> Result<KrpcResponse> {
        let transaction_id = generate_transaction_id();
        let query = get_peers_query(&transaction_id, &self.config.node_id, &self.info_hash)?;
        let reply = self.exchange(addr, &query).await?;
        let response = parse_response(&reply, &transaction_id)?;
        trace!(
            "get_peers from {}: {} nodes, {} values",
            addr,
            response.nodes.len(),
            response.values.len()
        );
        Ok(response)
    }

    /// One request/reply round trip on a fresh socket, bounded by the
    /// query timeout
    async fn exchange(&self, addr: SocketAddrV4, query: &[u8]) -> Result<Vec<u8>> {
        let network = |e: std::io::Error| TorrentError::network_error_full("DHT socket error", addr.to_string(), e.to_string());

        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await.map_err(network)?;
        socket.connect(addr).await.map_err(network)?;
        socket.send(query).await.map_err(network)?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = tokio::time::timeout(self.config.query_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| {
                TorrentError::dht_error_with_node("Query timed out", addr.to_string())
                    .with_context(format!("no reply within {:?}", self.config.query_timeout))
            })?
            .map_err(network)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Forward contacts and register listed nodes
    async fn absorb(&self, response: KrpcResponse) {
        for contact in response.values {
            if self.output.send(contact).await.is_err() {
                debug!("Contact stream closed, discarding {}", contact);
                break;
            }
        }
        for (id, addr) in response.nodes {
            self.discover(id, DhtNode::with_id(id, addr));
        }
    }

    /// Register a node; new ids are scheduled for their own probe
    fn discover(&self, id: NodeId, node: DhtNode) -> bool {
        if self.registry.register(id, node.clone()) == Registration::Refreshed {
            return false;
        }
        self.schedule(node)
    }

    fn schedule(&self, node: DhtNode) -> bool {
        // Keep one slot free so the queue never fills completely
        if self.schedule_tx.capacity() <= 1 {
            self.drop_candidate(&node);
            return false;
        }
        match self.schedule_tx.try_send(node) {
            Ok(()) => true,
            Err(TrySendError::Full(node)) => {
                self.drop_candidate(&node);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn drop_candidate(&self, node: &DhtNode) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("Scheduling queue full, dropping {} ({} dropped)", node.addr, dropped);
    }
}

/// Read distinct contacts from a crawl until `count` are collected, the
/// stream ends or `wait` elapses
pub async fn collect_contacts(
    contacts: &mut mpsc::Receiver<SocketAddrV4>,
    count: usize,
    wait: Duration,
) -> Vec<SocketAddrV4> {
    let mut seen = HashSet::new();
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + wait;

    while collected.len() < count {
        match tokio::time::timeout_at(deadline, contacts.recv()).await {
            Ok(Some(contact)) => {
                if seen.insert(contact) {
                    debug!("Collected contact {} ({} of {})", contact, collected.len() + 1, count);
                    collected.push(contact);
                }
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Stopped waiting for contacts with {} of {} collected", collected.len(), count);
                break;
            }
        }
    }
    collected
}
