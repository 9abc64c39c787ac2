//! Torrent file parser
//!
//! Decodes single-file `.torrent` descriptors with `serde_bencode`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;
use serde_bencode::value::Value;
use tracing::{debug, error, info};

use crate::error::TorrentError;
use crate::torrent::info::TorrentInfo;

/// Top level of a metainfo file; the info dictionary is kept as a raw
/// value so it can be re-encoded for the info hash
#[derive(Debug, Deserialize)]
struct RawTorrent {
    #[serde(default)]
    announce: Option<String>,
    info: Value,
}

pub struct TorrentParser;

impl TorrentParser {
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        debug!("Parsing torrent descriptor from {} bytes", data.len());
        let raw: RawTorrent = serde_bencode::from_bytes(data).map_err(|e| {
            error!("Failed to decode torrent descriptor: {}", e);
            TorrentError::from(e)
        })?;

        let info_dict = match &raw.info {
            Value::Dict(dict) => dict,
            _ => return Err(TorrentError::parse_error("info is not a dictionary").into()),
        };

        if info_dict.contains_key(b"files".as_slice()) {
            return Err(TorrentError::parse_error("Multi-file torrents are not supported").into());
        }

        let name = String::from_utf8_lossy(bytes_field(info_dict, "name")?).to_string();
        let piece_length = int_field(info_dict, "piece length")?;
        let length = int_field(info_dict, "length")?;
        let pieces = TorrentInfo::parse_piece_hashes(bytes_field(info_dict, "pieces")?)?;

        let encoded_info = serde_bencode::to_bytes(&raw.info).map_err(TorrentError::from)?;
        let info_hash = TorrentInfo::generate_info_hash(&encoded_info);

        let torrent = TorrentInfo {
            announce: raw.announce,
            info_hash,
            piece_length,
            pieces,
            name,
            length,
        };
        torrent.validate()?;

        info!(
            "Loaded torrent {} ({} bytes, {} pieces, info hash {})",
            torrent.name,
            torrent.length,
            torrent.piece_count(),
            torrent.info_hash_hex()
        );
        Ok(torrent)
    }

    pub fn parse_file(path: &Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());
        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;
        Self::parse_bytes(&data)
    }
}

fn bytes_field<'a>(dict: &'a HashMap<Vec<u8>, Value>, key: &str) -> Result<&'a [u8]> {
    match dict.get(key.as_bytes()) {
        Some(Value::Bytes(bytes)) => Ok(bytes),
        Some(_) => Err(TorrentError::parse_error(format!("Field '{}' is not a byte string", key)).into()),
        None => Err(TorrentError::parse_error(format!("Missing field '{}'", key)).into()),
    }
}

fn int_field(dict: &HashMap<Vec<u8>, Value>, key: &str) -> Result<u64> {
    match dict.get(key.as_bytes()) {
        Some(Value::Int(value)) if *value >= 0 => Ok(*value as u64),
        Some(_) => Err(TorrentError::parse_error(format!("Field '{}' is not a non-negative integer", key)).into()),
        None => Err(TorrentError::parse_error(format!("Missing field '{}'", key)).into()),
    }
}
