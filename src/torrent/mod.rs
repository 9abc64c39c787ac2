//! Torrent descriptors
//!
//! Parsing `.torrent` files into the metadata a download is built from.

pub mod info;
pub mod parser;

pub use info::TorrentInfo;
pub use parser::TorrentParser;
