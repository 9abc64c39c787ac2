//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::dht::bootstrap::{DEFAULT_DHT_PORT, DEFAULT_WORKERS};
use crate::storage::download::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_IN_FLIGHT};

/// CLI arguments for the downloader
#[derive(Debug, Parser)]
#[command(name = "swarm-downloader")]
#[command(about = "Download a torrent from a known swarm, or crawl the DHT for one", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download a single-file torrent
    Download {
        /// Path to the .torrent file
        #[arg(value_name = "TORRENT_FILE")]
        torrent_file: PathBuf,

        /// Peer to download from; repeat for more peers
        #[arg(long = "peer", value_name = "HOST:PORT")]
        peers: Vec<String>,

        /// Collect this many peers from the DHT before downloading
        #[arg(long, default_value_t = 0)]
        dht_peers: usize,

        /// Seconds to wait for DHT peers
        #[arg(long, default_value_t = 60)]
        dht_wait: u64,

        /// Download directory
        #[arg(short, long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Request size in bytes
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u32,

        /// Pieces requested at the same time
        #[arg(long, default_value_t = DEFAULT_MAX_IN_FLIGHT)]
        max_in_flight: usize,

        /// Keep downloading when a peer fails to connect
        #[arg(long)]
        drop_failed_peers: bool,

        /// Local peer id, 20 characters or 40 hex digits
        #[arg(long)]
        peer_id: Option<String>,

        #[command(flatten)]
        dht: DhtArgs,
    },

    /// Crawl the DHT and print peers for an info hash
    Crawl {
        /// Info hash as 40 hex digits
        #[arg(value_name = "INFO_HASH")]
        info_hash: String,

        /// Stop after printing this many distinct peers
        #[arg(long)]
        limit: Option<usize>,

        #[command(flatten)]
        dht: DhtArgs,
    },
}

/// Options shared by every command that crawls the DHT
#[derive(Debug, Clone, Args)]
pub struct DhtArgs {
    /// DHT node id as 40 hex digits
    #[arg(long)]
    pub node_id: Option<String>,

    /// Bootstrap router; repeat to replace the built-in list
    #[arg(long = "bootstrap", value_name = "HOST")]
    pub bootstrap: Vec<String>,

    /// Port of the bootstrap routers
    #[arg(long, default_value_t = DEFAULT_DHT_PORT)]
    pub dht_port: u16,

    /// Concurrent get_peers probes
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub dht_workers: usize,

    /// Per-query timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub dht_timeout_ms: u64,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
