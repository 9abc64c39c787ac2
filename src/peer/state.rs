//! Peer contact and session state

use std::fmt;
use std::net::SocketAddrV4;
use std::str::FromStr;

use crate::error::TorrentError;

/// Where to reach a peer: host name or address plus TCP port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerContact {
    pub host: String,
    pub port: u16,
}

impl PeerContact {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddrV4> for PeerContact {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for PeerContact {
    type Err = TorrentError;

    /// Parse `host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TorrentError::validation_error_with_field(format!("Missing port in '{}'", s), "peer"))?;
        if host.is_empty() {
            return Err(TorrentError::validation_error_with_field(format!("Missing host in '{}'", s), "peer"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| TorrentError::validation_error_with_field(format!("Invalid port in '{}': {}", s, e), "peer"))?;
        Ok(Self::new(host, port))
    }
}

/// Lifecycle of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connected,
    Handshaking,
    Established,
    Closed,
}

impl SessionState {
    /// Whether requests may be written on this session
    pub fn is_established(&self) -> bool {
        matches!(self, SessionState::Established)
    }
}

/// Choke and interest flags for one session.
///
/// `am_choked` is not kept here: it changes from the receive loop and is
/// published through a watch channel instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags {
    /// We are choking the remote peer
    pub peer_choked: bool,
    /// We told the remote peer we are interested
    pub am_interested: bool,
    /// The remote peer is interested in us
    pub peer_interested: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            peer_choked: true,
            am_interested: false,
            peer_interested: true,
        }
    }
}

/// Which pieces a remote peer advertises
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield(Vec<u8>);

impl Bitfield {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.0
            .get(index / 8)
            .map_or(false, |byte| (byte >> (7 - index % 8)) & 1 == 1)
    }

    /// Set the bit for `index`, growing the field if needed
    pub fn set_piece(&mut self, index: usize) {
        let byte = index / 8;
        if self.0.len() <= byte {
            self.0.resize(byte + 1, 0);
        }
        self.0[byte] |= 1 << (7 - index % 8);
    }

    pub fn piece_count(&self) -> usize {
        self.0.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
