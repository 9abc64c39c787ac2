//! Peer session
//!
//! One TCP connection to one remote peer: connect, handshake, a background
//! receive loop feeding blocks into the shared queue, and request
//! pipelining gated on the remote choke state.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncRead;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::state::{Bitfield, PeerContact, PeerFlags, SessionState};
use crate::protocol::{BitTorrentWire, Handshake, Message, WireProtocol};
use crate::storage::piece::{block_requests, Block};

/// Why a receive loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// The connection failed or the peer closed it
    Disconnected,
    /// Nobody is draining the block queue any more
    QueueClosed,
}

/// A session with one remote peer
pub struct PeerSession {
    contact: PeerContact,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    piece_length: u64,
    state: SessionState,
    flags: PeerFlags,
    remote_peer_id: Option<[u8; 20]>,
    stream: Option<TcpStream>,
    writer: Option<Arc<Mutex<OwnedWriteHalf>>>,
    choked_tx: Option<watch::Sender<bool>>,
    choked: watch::Receiver<bool>,
    bitfield: Arc<RwLock<Bitfield>>,
    blocks: Option<mpsc::Sender<Block>>,
    wire: BitTorrentWire,
    receiver: Option<JoinHandle<ReceiveEnd>>,
}

impl PeerSession {
    pub fn new(
        contact: PeerContact,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        piece_length: u64,
        blocks: mpsc::Sender<Block>,
    ) -> Self {
        let (choked_tx, choked) = watch::channel(true);
        Self {
            contact,
            info_hash,
            peer_id,
            piece_length,
            state: SessionState::Disconnected,
            flags: PeerFlags::default(),
            remote_peer_id: None,
            stream: None,
            writer: None,
            choked_tx: Some(choked_tx),
            choked,
            bitfield: Arc::new(RwLock::new(Bitfield::default())),
            blocks: Some(blocks),
            wire: BitTorrentWire,
            receiver: None,
        }
    }

    pub fn contact(&self) -> &PeerContact {
        &self.contact
    }

    pub fn state(&self) -> SessionState {
        if self.state.is_established() && self.receiver.as_ref().map_or(false, |r| r.is_finished()) {
            return SessionState::Closed;
        }
        self.state
    }

    pub fn flags(&self) -> PeerFlags {
        self.flags
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn remote_peer_id(&self) -> Option<[u8; 20]> {
        self.remote_peer_id
    }

    /// Whether the remote peer currently chokes us
    pub fn is_choked(&self) -> bool {
        *self.choked.borrow()
    }

    /// Open the TCP connection
    pub async fn connect(&mut self) -> Result<()> {
        info!("Connecting to peer: {}", self.contact);
        let stream = TcpStream::connect((self.contact.host.as_str(), self.contact.port))
            .await
            .map_err(|e| {
                error!("Failed to connect to {}: {}", self.contact, e);
                self.state = SessionState::Closed;
                TorrentError::peer_error_full("Failed to connect", self.contact.to_string(), e.to_string())
            })?;
        stream.set_nodelay(true).ok();

        self.stream = Some(stream);
        self.state = SessionState::Connected;
        debug!("Connected to peer: {}", self.contact);
        Ok(())
    }

    /// Exchange handshakes and check that the peer serves our torrent
    pub async fn handshake(&mut self) -> Result<()> {
        let contact = self.contact.to_string();
        if self.state != SessionState::Connected {
            return Err(TorrentError::peer_error_with_peer("Handshake requires a fresh connection", contact).into());
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TorrentError::peer_error_with_peer("Session has no connection", contact.clone()))?;
        self.state = SessionState::Handshaking;

        let ours = Handshake::new(self.info_hash, self.peer_id);
        let mut wire = self.wire;
        let result = async {
            wire.write_handshake(&mut *stream, &ours).await?;
            wire.read_handshake(&mut *stream).await
        }
        .await;

        let theirs = match result {
            Ok(theirs) if theirs.validate(&self.info_hash) => theirs,
            Ok(_) => {
                self.close();
                return Err(TorrentError::peer_error_full(
                    "Handshake validation failed",
                    contact,
                    "info hash mismatch",
                )
                .into());
            }
            Err(e) => {
                error!("Handshake with {} failed: {}", contact, e);
                self.close();
                return Err(TorrentError::peer_error_full("Handshake failed", contact, e.to_string()).into());
            }
        };

        self.remote_peer_id = Some(theirs.peer_id);
        self.state = SessionState::Established;
        debug!("Handshake completed with {} (peer id {})", contact, hex::encode(theirs.peer_id));
        Ok(())
    }

    /// Split the connection and spawn the receive loop
    pub fn start_receiving(&mut self) -> Result<()> {
        let contact = self.contact.to_string();
        if !self.state.is_established() {
            return Err(TorrentError::peer_error_with_peer("Session not established", contact).into());
        }
        let stream = self
            .stream
            .take()
            .ok_or_else(|| TorrentError::peer_error_with_peer("Receive loop already running", contact.clone()))?;
        let (choked, blocks) = match (self.choked_tx.take(), self.blocks.take()) {
            (Some(choked), Some(blocks)) => (choked, blocks),
            _ => return Err(TorrentError::peer_error_with_peer("Receive loop already running", contact).into()),
        };

        let (reader, writer) = stream.into_split();
        self.writer = Some(Arc::new(Mutex::new(writer)));

        let context = ReceiveContext {
            peer: contact,
            choked,
            bitfield: self.bitfield.clone(),
            blocks,
        };
        self.receiver = Some(tokio::spawn(receive_loop(reader, context)));
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        let contact = self.contact.to_string();
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| TorrentError::peer_error_with_peer("Session has no writer", contact.clone()))?;
        let mut wire = self.wire;
        let mut writer = writer.lock().await;
        wire.write_message(&mut *writer, message).await.map_err(|e| {
            error!("Failed to send {:?} to {}: {}", message.id(), contact, e);
            TorrentError::peer_error_full("Failed to send message", contact.clone(), e.to_string())
        })?;
        Ok(())
    }

    pub async fn send_unchoke(&mut self) -> Result<()> {
        self.send(&Message::Unchoke).await?;
        self.flags.peer_choked = false;
        Ok(())
    }

    pub async fn send_interested(&mut self) -> Result<()> {
        self.send(&Message::Interested).await?;
        self.flags.am_interested = true;
        Ok(())
    }

    /// Cloneable request handle for this session
    pub fn handle(&self) -> Result<PeerHandle> {
        let writer = self.writer.clone().ok_or_else(|| {
            TorrentError::peer_error_with_peer("Receive loop not started", self.contact.to_string())
        })?;
        Ok(PeerHandle {
            peer: self.contact.to_string(),
            writer,
            choked: self.choked.clone(),
            bitfield: self.bitfield.clone(),
        })
    }

    /// Connect, handshake, start receiving and announce unchoke and
    /// interest
    pub async fn establish(&mut self) -> Result<PeerHandle> {
        self.connect().await?;
        self.handshake().await?;
        self.start_receiving()?;
        self.send_unchoke().await?;
        self.send_interested().await?;
        info!("Session with {} established", self.contact);
        self.handle()
    }

    /// Tear down the connection and the receive loop
    pub fn close(&mut self) {
        self.stream = None;
        self.writer = None;
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        self.state = SessionState::Closed;
        debug!("Session with {} closed", self.contact);
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }
}

/// Shared write side of an established session
#[derive(Clone)]
pub struct PeerHandle {
    peer: String,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    choked: watch::Receiver<bool>,
    bitfield: Arc<RwLock<Bitfield>>,
}

impl PeerHandle {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the peer announced `index` through `bitfield` or `have`
    pub async fn has_piece(&self, index: u32) -> bool {
        self.bitfield.read().await.has_piece(index as usize)
    }

    /// Wait until the remote peer unchokes us
    async fn wait_unchoked(&self) -> Result<()> {
        let mut choked = self.choked.clone();
        if *choked.borrow() {
            trace!("Waiting for {} to unchoke", self.peer);
        }
        choked.wait_for(|choked| !*choked).await.map_err(|_| {
            TorrentError::peer_error_with_peer("Connection closed while choked", self.peer.clone())
        })?;
        Ok(())
    }

    /// Request every block of a piece in offset order, pausing whenever the
    /// peer chokes us
    pub async fn request_piece(&self, index: u32, length: u32, block_size: u32) -> Result<()> {
        for (begin, len) in block_requests(length, block_size) {
            self.wait_unchoked().await?;
            let request = Message::Request {
                index,
                begin,
                length: len,
            };
            let mut writer = self.writer.lock().await;
            BitTorrentWire.write_message(&mut *writer, &request).await.map_err(|e| {
                warn!("Failed to request piece {} block {} from {}: {}", index, begin, self.peer, e);
                TorrentError::peer_error_full("Failed to send request", self.peer.clone(), e.to_string())
            })?;
        }
        trace!("Requested piece {} from {}", index, self.peer);
        Ok(())
    }
}

struct ReceiveContext {
    peer: String,
    choked: watch::Sender<bool>,
    bitfield: Arc<RwLock<Bitfield>>,
    blocks: mpsc::Sender<Block>,
}

/// Read frames until the connection fails, dispatching each message
async fn receive_loop<R: AsyncRead + Unpin>(mut reader: R, context: ReceiveContext) -> ReceiveEnd {
    let mut wire = BitTorrentWire;
    loop {
        let frame = match wire.read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                info!("Connection to {} closed: {}", context.peer, e);
                return ReceiveEnd::Disconnected;
            }
        };

        let message = match frame.into_message() {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed message from {}: {}", context.peer, e);
                continue;
            }
        };

        match message {
            Message::KeepAlive => trace!("Keep-alive from {}", context.peer),
            Message::Piece { index, begin, block } => {
                trace!("Block {}:{} ({} bytes) from {}", index, begin, block.len(), context.peer);
                if context.blocks.send(Block::new(index, begin, block)).await.is_err() {
                    debug!("Block queue closed, stopping receive loop for {}", context.peer);
                    return ReceiveEnd::QueueClosed;
                }
            }
            Message::Unchoke => {
                debug!("Unchoked by {}", context.peer);
                context.choked.send_replace(false);
            }
            Message::Choke => {
                debug!("Choked by {}", context.peer);
                context.choked.send_replace(true);
            }
            Message::Bitfield { bitfield } => {
                debug!("Bitfield of {} bytes from {}", bitfield.len(), context.peer);
                *context.bitfield.write().await = Bitfield::new(bitfield);
            }
            Message::Have { piece_index } => {
                context.bitfield.write().await.set_piece(piece_index as usize);
            }
            Message::Unknown { id, payload } => {
                warn!("Unrecognized message type {} ({} bytes) from {}", id, payload.len(), context.peer);
            }
            other => debug!("Ignoring {:?} from {}", other.id(), context.peer),
        }
    }
}
