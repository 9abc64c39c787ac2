//! Peer sessions
//!
//! Connection lifecycle, handshake, receive loop and request pipelining
//! for individual remote peers.

pub mod connection;
pub mod state;

pub use connection::{PeerHandle, PeerSession, ReceiveEnd};
pub use state::{Bitfield, PeerContact, PeerFlags, SessionState};
