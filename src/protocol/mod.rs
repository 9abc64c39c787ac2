//! BitTorrent peer wire protocol
//!
//! Handshake, message codec and stream framing.

pub mod handshake;
pub mod message;
pub mod wire;

pub use handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{BitTorrentWire, Frame, WireProtocol, MAX_FRAME_LEN};
