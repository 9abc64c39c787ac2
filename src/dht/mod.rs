//! DHT module
//!
//! Crawls the mainline DHT for peers of one info hash.

pub mod bootstrap;
pub mod crawler;
pub mod message;
pub mod node;
pub mod registry;

pub use bootstrap::{resolve_bootstrap_nodes, DhtConfig, DEFAULT_BOOTSTRAP_HOSTS};
pub use crawler::{collect_contacts, DhtCrawler};
pub use message::{generate_transaction_id, parse_compact_nodes, parse_compact_peers, KrpcResponse};
pub use node::{DhtNode, NodeId};
pub use registry::{NodeRegistry, Registration};
