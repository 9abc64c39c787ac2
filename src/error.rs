//! Error types for the swarm downloader
//!
//! Every subsystem reports failures through [`TorrentError`]; fallible
//! functions return `anyhow::Result` and convert with `.into()`.

use std::fmt;

/// Error type shared by the piece store, peer sessions, the download
/// manager and the DHT crawler
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Torrent descriptor decoding errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Peer wire framing and decoding errors
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Failures scoped to a single peer session
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Target file I/O errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// A fully received piece did not match its expected SHA-1
    IntegrityError {
        message: String,
        piece: Option<u32>,
    },

    /// KRPC query errors
    DHTError {
        message: String,
        node: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Socket and name resolution errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn peer_error(message: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    pub fn storage_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Integrity fault for a specific piece
    pub fn integrity_error(message: impl Into<String>, piece: u32) -> Self {
        TorrentError::IntegrityError {
            message: message.into(),
            piece: Some(piece),
        }
    }

    pub fn dht_error(message: impl Into<String>) -> Self {
        TorrentError::DHTError {
            message: message.into(),
            node: None,
            source: None,
        }
    }

    pub fn dht_error_with_node(message: impl Into<String>, node: impl Into<String>) -> Self {
        TorrentError::DHTError {
            message: message.into(),
            node: Some(node.into()),
            source: None,
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Append context to the error's source chain
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        let chain = |source: &mut Option<String>| {
            *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
        };
        match &mut self {
            TorrentError::ParseError { source, .. }
            | TorrentError::ProtocolError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::DHTError { source, .. }
            | TorrentError::NetworkError { source, .. } => chain(source),
            _ => {}
        }
        self
    }

    /// Whether the error must abort the whole download
    pub fn is_fatal(&self) -> bool {
        matches!(self, TorrentError::IntegrityError { .. } | TorrentError::StorageError { .. })
    }
}

impl TorrentError {
    fn kind(&self) -> &'static str {
        match self {
            TorrentError::ParseError { .. } => "Parse error",
            TorrentError::ProtocolError { .. } => "Protocol error",
            TorrentError::PeerError { .. } => "Peer error",
            TorrentError::StorageError { .. } => "Storage error",
            TorrentError::IntegrityError { .. } => "Integrity error",
            TorrentError::DHTError { .. } => "DHT error",
            TorrentError::ConfigError { .. } => "Config error",
            TorrentError::NetworkError { .. } => "Network error",
            TorrentError::ValidationError { .. } => "Validation error",
        }
    }

    /// Message plus the labelled details that are present
    fn parts(&self) -> (&str, Vec<(&'static str, String)>) {
        let mut details = Vec::new();
        let mut push = |label: &'static str, value: Option<String>| {
            if let Some(value) = value {
                details.push((label, value));
            }
        };
        let message = match self {
            TorrentError::ParseError { message, source } | TorrentError::ProtocolError { message, source } => {
                push("source", source.clone());
                message
            }
            TorrentError::PeerError { message, peer, source } => {
                push("peer", peer.clone());
                push("source", source.clone());
                message
            }
            TorrentError::StorageError { message, path, source } => {
                push("path", path.clone());
                push("source", source.clone());
                message
            }
            TorrentError::IntegrityError { message, piece } => {
                push("piece", piece.map(|index| index.to_string()));
                message
            }
            TorrentError::DHTError { message, node, source } => {
                push("node", node.clone());
                push("source", source.clone());
                message
            }
            TorrentError::NetworkError { message, address, source } => {
                push("address", address.clone());
                push("source", source.clone());
                message
            }
            TorrentError::ConfigError { message, field } | TorrentError::ValidationError { message, field } => {
                push("field", field.clone());
                message
            }
        };
        (message.as_str(), details)
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (message, details) = self.parts();
        write!(f, "{}: {}", self.kind(), message)?;
        if !details.is_empty() {
            let details = details
                .iter()
                .map(|(label, value)| format!("{}: {}", label, value))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to decode bencode data", err.to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}
