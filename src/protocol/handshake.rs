//! BitTorrent handshake
//!
//! The first 68 bytes exchanged on every peer connection.

use bytes::{BufMut, BytesMut};
use anyhow::Result;
use tracing::{debug, error, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total length of a handshake on the wire
pub const HANDSHAKE_LEN: usize = 68;

/// Client prefix used for generated peer ids
const PEER_ID_PREFIX: &[u8; 8] = b"-SD0001-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved bytes, all zero for this client
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer id
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer id carrying the client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        debug!("Generated peer id: {}", hex::encode(peer_id));
        peer_id
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() < HANDSHAKE_LEN {
            error!("Handshake too short: expected {} bytes, got {}", HANDSHAKE_LEN, data.len());
            return Err(TorrentError::protocol_error_with_source(
                "Handshake too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            )
            .into());
        }

        if data[0] != PROTOCOL_LENGTH || &data[1..20] != PROTOCOL_STRING {
            warn!("Handshake carries an unexpected protocol identifier");
            return Err(TorrentError::protocol_error("Invalid protocol identifier").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Whether the remote handshake is for the expected torrent
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.serialize();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);

        assert_eq!(Handshake::deserialize(&bytes).unwrap(), handshake);
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = Handshake::generate_peer_id();
        assert_eq!(&peer_id[..8], b"-SD0001-");
        assert_ne!(peer_id, Handshake::generate_peer_id());
    }

    #[test]
    fn test_validate_info_hash() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20]));
        assert!(!handshake.validate(&[3u8; 20]));
    }

    #[test]
    fn test_rejects_short_or_foreign_handshake() {
        assert!(Handshake::deserialize(&[0u8; 40]).is_err());
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[5] = b'X';
        assert!(Handshake::deserialize(&bytes).is_err());
    }
}
