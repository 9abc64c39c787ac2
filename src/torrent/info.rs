//! Torrent descriptor
//!
//! The metadata a download needs: info hash, file name and size, piece
//! length and the per-piece SHA-1 digests.

use anyhow::Result;
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// Single-file torrent metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    /// Tracker announce URL, if the descriptor carries one
    pub announce: Option<String>,
    /// SHA-1 of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes (the last one may be shorter)
    pub piece_length: u64,
    /// Expected SHA-1 digest of every piece
    pub pieces: Vec<[u8; 20]>,
    /// File name
    pub name: String,
    /// File size in bytes
    pub length: u64,
}

impl TorrentInfo {
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// SHA-1 over the encoded info dictionary
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Split the concatenated `pieces` field into 20-byte digests
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error_with_source(
                "Invalid pieces field",
                format!("length {} is not a multiple of 20", pieces_bytes.len()),
            )
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Check that piece length, piece count and file length agree
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) || self.name == ".." {
            return Err(TorrentError::validation_error_with_field(format!("Unsafe file name '{}'", self.name), "name").into());
        }
        if self.piece_length == 0 || self.piece_length > u32::MAX as u64 {
            return Err(TorrentError::validation_error_with_field("Invalid piece length", "piece length").into());
        }
        if self.pieces.is_empty() {
            return Err(TorrentError::validation_error_with_field("Torrent has no pieces", "pieces").into());
        }

        let expected = (self.length + self.piece_length - 1) / self.piece_length;
        if self.length == 0 || expected != self.pieces.len() as u64 {
            return Err(TorrentError::validation_error_with_field(
                format!(
                    "{} bytes need {} pieces of {} bytes, descriptor lists {}",
                    self.length,
                    expected,
                    self.piece_length,
                    self.pieces.len()
                ),
                "length",
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TorrentInfo {
        TorrentInfo {
            announce: None,
            info_hash: [0u8; 20],
            piece_length: 4,
            pieces: vec![[1u8; 20], [2u8; 20], [3u8; 20]],
            name: "sample.bin".to_string(),
            length: 10,
        }
    }

    #[test]
    fn test_parse_piece_hashes() {
        let bytes = [[1u8; 20], [2u8; 20]].concat();
        let hashes = TorrentInfo::parse_piece_hashes(&bytes).unwrap();
        assert_eq!(hashes, vec![[1u8; 20], [2u8; 20]]);
        assert!(TorrentInfo::parse_piece_hashes(&[0u8; 21]).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let mut short = sample();
        short.length = 8;
        assert!(short.validate().is_err());

        let mut unsafe_name = sample();
        unsafe_name.name = "../etc/passwd".to_string();
        assert!(unsafe_name.validate().is_err());

        let mut zero = sample();
        zero.piece_length = 0;
        assert!(zero.validate().is_err());
    }
}
