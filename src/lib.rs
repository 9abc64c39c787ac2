//! swarm-downloader
//!
//! Downloads a single-file torrent from a known set of peers, verifying
//! every piece, and crawls the mainline DHT to find such peers.

pub mod cli;
pub mod dht;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;

pub use error::TorrentError;

pub use cli::{CliArgs, Config, Mode};
pub use dht::{collect_contacts, DhtConfig, DhtCrawler, DhtNode, NodeId, NodeRegistry};
pub use peer::{PeerContact, PeerHandle, PeerSession};
pub use protocol::{Handshake, Message, MessageId};
pub use storage::{
    Block, ConcurrencyGate, DownloadConfig, DownloadManager, FileBackend, MemoryBackend, PeerFailurePolicy, Piece,
    StorageBackend, TargetFile,
};
pub use torrent::{TorrentInfo, TorrentParser};
