//! Storage module
//!
//! Piece assembly, verification and the target file, plus the download
//! manager that feeds them from the swarm.

pub mod backend;
pub mod download;
pub mod file;
pub mod gate;
pub mod piece;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use download::{DownloadConfig, DownloadManager, PeerFailurePolicy};
pub use file::{BlockOutcome, TargetFile};
pub use gate::ConcurrencyGate;
pub use piece::{Block, Piece, PieceProgress};
