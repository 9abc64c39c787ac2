//! CLI configuration module
//!
//! Turns parsed arguments into the validated settings each command runs
//! with.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::cli::args::{CliArgs, Command, DhtArgs};
use crate::dht::{DhtConfig, NodeId};
use crate::error::TorrentError;
use crate::peer::PeerContact;
use crate::protocol::Handshake;
use crate::storage::download::MAX_BLOCK_SIZE;
use crate::storage::{DownloadConfig, PeerFailurePolicy};

/// What the binary was asked to do
#[derive(Debug, Clone)]
pub enum Mode {
    Download {
        torrent_file: PathBuf,
        output_dir: PathBuf,
        peers: Vec<PeerContact>,
        /// Contacts to collect from the DHT first
        dht_peers: usize,
        dht_wait: Duration,
        download: DownloadConfig,
    },
    Crawl {
        info_hash: [u8; 20],
        limit: Option<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub dht: DhtConfig,
    pub verbose: bool,
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let (mode, dht) = match &args.command {
            Command::Download {
                torrent_file,
                peers,
                dht_peers,
                dht_wait,
                output_dir,
                block_size,
                max_in_flight,
                drop_failed_peers,
                peer_id,
                dht,
            } => {
                let peers = peers
                    .iter()
                    .map(|peer| peer.parse::<PeerContact>())
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let peer_id = match peer_id {
                    Some(raw) => parse_peer_id(raw)?,
                    None => Handshake::generate_peer_id(),
                };
                let download = DownloadConfig {
                    block_size: *block_size,
                    max_in_flight: *max_in_flight,
                    peer_failure_policy: if *drop_failed_peers {
                        PeerFailurePolicy::DropPeer
                    } else {
                        PeerFailurePolicy::AbortSwarm
                    },
                    ..DownloadConfig::new(peer_id)
                };
                let mode = Mode::Download {
                    torrent_file: torrent_file.clone(),
                    output_dir: output_dir.clone().unwrap_or_else(|| PathBuf::from("./downloads")),
                    peers,
                    dht_peers: *dht_peers,
                    dht_wait: Duration::from_secs(*dht_wait),
                    download,
                };
                (mode, dht_config(dht)?)
            }
            Command::Crawl { info_hash, limit, dht } => {
                let info_hash = NodeId::from_hex(info_hash).ok_or_else(|| {
                    TorrentError::config_error_with_field("Info hash must be 40 hex digits", "info_hash")
                })?;
                let mode = Mode::Crawl {
                    info_hash: *info_hash.as_bytes(),
                    limit: *limit,
                };
                (mode, dht_config(dht)?)
            }
        };

        Ok(Self {
            mode,
            dht,
            verbose: args.verbose,
            quiet: args.quiet,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Mode::Download {
            output_dir,
            peers,
            dht_peers,
            download,
            ..
        } = &self.mode
        {
            if peers.is_empty() && *dht_peers == 0 {
                return Err(TorrentError::config_error("No peers given; use --peer or --dht-peers").into());
            }
            if download.block_size == 0 || download.block_size > MAX_BLOCK_SIZE {
                return Err(TorrentError::config_error_with_field(
                    format!("Block size must be between 1 and {} bytes", MAX_BLOCK_SIZE),
                    "block_size",
                )
                .into());
            }
            if download.max_in_flight == 0 {
                return Err(TorrentError::config_error_with_field("Must allow at least one piece in flight", "max_in_flight").into());
            }
            if output_dir.as_os_str().is_empty() {
                return Err(TorrentError::config_error_with_field("Output directory cannot be empty", "output_dir").into());
            }
        }

        if self.dht.workers == 0 {
            return Err(TorrentError::config_error_with_field("Need at least one DHT worker", "dht_workers").into());
        }
        if self.dht.query_timeout.is_zero() {
            return Err(TorrentError::config_error_with_field("DHT timeout must be positive", "dht_timeout_ms").into());
        }

        Ok(())
    }
}

fn dht_config(args: &DhtArgs) -> Result<DhtConfig> {
    let node_id = match &args.node_id {
        Some(hex_id) => NodeId::from_hex(hex_id)
            .ok_or_else(|| TorrentError::config_error_with_field("Node id must be 40 hex digits", "node_id"))?,
        None => NodeId::random(),
    };

    let mut config = DhtConfig::new(node_id);
    if !args.bootstrap.is_empty() {
        config.bootstrap_hosts = args.bootstrap.clone();
    }
    config.port = args.dht_port;
    config.workers = args.dht_workers;
    config.query_timeout = Duration::from_millis(args.dht_timeout_ms);
    Ok(config)
}

/// Accept a peer id as 20 raw characters or 40 hex digits
fn parse_peer_id(raw: &str) -> Result<[u8; 20]> {
    if let Ok(id) = <[u8; 20]>::try_from(raw.as_bytes()) {
        return Ok(id);
    }
    NodeId::from_hex(raw)
        .map(|id| *id.as_bytes())
        .ok_or_else(|| TorrentError::config_error_with_field("Peer id must be 20 characters or 40 hex digits", "peer_id").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Result<Config> {
        let args = CliArgs::try_parse_from(std::iter::once("swarm-downloader").chain(args.iter().copied())).unwrap();
        Config::from_args(&args)
    }

    #[test]
    fn test_download_config_from_args() {
        let config = parse(&[
            "download",
            "a.torrent",
            "--peer",
            "127.0.0.1:6881",
            "--peer",
            "seed.example:51413",
            "--block-size",
            "2",
            "--max-in-flight",
            "3",
            "--drop-failed-peers",
            "--peer-id",
            "SD0001-abcdefghijklm",
            "-o",
            "/tmp/out",
        ])
        .unwrap();
        config.validate().unwrap();

        match &config.mode {
            Mode::Download {
                peers,
                output_dir,
                download,
                ..
            } => {
                assert_eq!(peers.len(), 2);
                assert_eq!(peers[1], PeerContact::new("seed.example", 51413));
                assert_eq!(output_dir, &PathBuf::from("/tmp/out"));
                assert_eq!(download.block_size, 2);
                assert_eq!(download.max_in_flight, 3);
                assert_eq!(download.block_queue_capacity, 100);
                assert_eq!(download.peer_failure_policy, PeerFailurePolicy::DropPeer);
                assert_eq!(&download.peer_id, b"SD0001-abcdefghijklm");
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_download_needs_a_peer_source() {
        let config = parse(&["download", "a.torrent"]).unwrap();
        assert!(config.validate().is_err());

        let config = parse(&["download", "a.torrent", "--dht-peers", "5"]).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(parse(&["download", "a.torrent", "--peer", "no-port"]).is_err());
        assert!(parse(&["download", "a.torrent", "--peer-id", "short"]).is_err());
        assert!(parse(&["crawl", "not-hex"]).is_err());

        let zero = parse(&["download", "a.torrent", "--peer", "h:1", "--max-in-flight", "0"]).unwrap();
        assert!(zero.validate().is_err());
        let huge = parse(&["download", "a.torrent", "--peer", "h:1", "--block-size", "4194304"]).unwrap();
        assert!(huge.validate().is_err());
        let limit = MAX_BLOCK_SIZE.to_string();
        let largest = parse(&["download", "a.torrent", "--peer", "h:1", "--block-size", &limit]).unwrap();
        assert!(largest.validate().is_ok());
        let zero = parse(&["crawl", &"ab".repeat(20), "--dht-workers", "0"]).unwrap();
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_crawl_config() {
        let hash = "0123456789abcdef0123456789abcdef01234567";
        let node = "ff".repeat(20);
        let config = parse(&["crawl", hash, "--node-id", &node, "--bootstrap", "127.0.0.1", "--dht-timeout-ms", "250"]).unwrap();
        config.validate().unwrap();

        match config.mode {
            Mode::Crawl { info_hash, limit } => {
                assert_eq!(hex::encode(info_hash), hash);
                assert_eq!(limit, None);
            }
            other => panic!("unexpected mode {:?}", other),
        }
        assert_eq!(config.dht.node_id, NodeId::new([0xFF; 20]));
        assert_eq!(config.dht.bootstrap_hosts, vec!["127.0.0.1".to_string()]);
        assert_eq!(config.dht.query_timeout, Duration::from_millis(250));
    }
}
