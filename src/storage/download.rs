//! Download manager
//!
//! Drives one torrent download: a single assembly task drains the shared
//! block queue into the [`TargetFile`], while the dispatcher walks the
//! pieces in index order and fans each one out to every peer session under
//! the [`ConcurrencyGate`].

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::TorrentError;
use crate::peer::{PeerContact, PeerHandle, PeerSession};
use crate::protocol::MAX_FRAME_LEN;
use crate::storage::backend::{FileBackend, StorageBackend};
use crate::storage::file::{BlockOutcome, TargetFile};
use crate::storage::gate::ConcurrencyGate;
use crate::storage::piece::Block;
use crate::torrent::TorrentInfo;

/// Default request granularity in bytes
pub const DEFAULT_BLOCK_SIZE: u32 = 8192;

/// Largest block whose `piece` frame (id, index, begin, payload) still
/// fits in one wire frame
pub const MAX_BLOCK_SIZE: u32 = (MAX_FRAME_LEN - 9) as u32;

/// Default number of pieces requested at the same time
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1;

/// Default capacity of the block queue between sessions and the assembler
pub const DEFAULT_BLOCK_QUEUE: usize = 100;

/// What to do when a peer fails to connect or handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerFailurePolicy {
    /// Abort the whole download
    #[default]
    AbortSwarm,
    /// Continue without that peer; fail only if no peer is left
    DropPeer,
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Local peer id sent in every handshake
    pub peer_id: [u8; 20],
    /// Block size for every piece except the last
    pub block_size: u32,
    /// Pieces requested concurrently across the swarm
    pub max_in_flight: usize,
    /// Capacity of the shared block queue
    pub block_queue_capacity: usize,
    pub peer_failure_policy: PeerFailurePolicy,
}

impl DownloadConfig {
    pub fn new(peer_id: [u8; 20]) -> Self {
        Self {
            peer_id,
            block_size: DEFAULT_BLOCK_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            block_queue_capacity: DEFAULT_BLOCK_QUEUE,
            peer_failure_policy: PeerFailurePolicy::default(),
        }
    }
}

/// Downloads one torrent from a fixed set of peers
pub struct DownloadManager {
    torrent: Arc<TorrentInfo>,
    config: DownloadConfig,
    sessions: Vec<PeerSession>,
    file: TargetFile,
    blocks: mpsc::Receiver<Block>,
    gate: Arc<ConcurrencyGate>,
}

impl DownloadManager {
    /// Create a manager writing `<name>.part` inside `output_dir`
    pub async fn new(
        torrent: TorrentInfo,
        contacts: Vec<PeerContact>,
        config: DownloadConfig,
        output_dir: &Path,
    ) -> Result<Self> {
        let backend = FileBackend::create(output_dir, &torrent.name).await?;
        Self::with_backend(torrent, contacts, config, Box::new(backend))
    }

    /// Create a manager on an explicit storage backend
    pub fn with_backend(
        torrent: TorrentInfo,
        contacts: Vec<PeerContact>,
        config: DownloadConfig,
        backend: Box<dyn StorageBackend>,
    ) -> Result<Self> {
        if config.block_size == 0 || config.block_size > MAX_BLOCK_SIZE {
            return Err(TorrentError::config_error_with_field(
                format!("Block size must be between 1 and {} bytes", MAX_BLOCK_SIZE),
                "block_size",
            )
            .into());
        }
        torrent.validate()?;

        let file = TargetFile::from_torrent(&torrent, config.block_size, backend)?;
        let (tx, blocks) = mpsc::channel(config.block_queue_capacity.max(1));
        let sessions = contacts
            .into_iter()
            .map(|contact| PeerSession::new(contact, torrent.info_hash, config.peer_id, torrent.piece_length, tx.clone()))
            .collect::<Vec<_>>();
        let gate = Arc::new(ConcurrencyGate::new(config.max_in_flight));

        info!(
            "Download manager for {} with {} peers, {} pieces, block size {}",
            torrent.name,
            sessions.len(),
            file.piece_count(),
            config.block_size
        );

        Ok(Self {
            torrent: Arc::new(torrent),
            config,
            sessions,
            file,
            blocks,
            gate,
        })
    }

    pub fn peer_count(&self) -> usize {
        self.sessions.len()
    }

    /// The gate shared by the dispatcher and the assembler
    pub fn gate(&self) -> Arc<ConcurrencyGate> {
        self.gate.clone()
    }

    /// Run the download on its own task
    pub fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.download())
    }

    /// Run the download to completion.
    ///
    /// Returns once every piece is verified, written and the file has been
    /// moved to its final name.
    pub async fn download(self) -> Result<()> {
        let DownloadManager {
            torrent,
            config,
            mut sessions,
            file,
            blocks,
            gate,
        } = self;

        let plan: Vec<(u32, u32)> = (0..file.piece_count() as u32)
            .filter_map(|index| file.piece(index).map(|piece| (piece.length, piece.block_size)))
            .collect();

        info!("Starting download of {} ({} pieces)", torrent.name, plan.len());
        let mut assembler = tokio::spawn(assemble(file, blocks, gate.clone()));

        let handles = match connect_swarm(&mut sessions, config.peer_failure_policy).await {
            Ok(handles) => handles,
            Err(e) => {
                assembler.abort();
                return Err(e);
            }
        };

        tokio::select! {
            result = &mut assembler => {
                gate.close();
                return join_result(result);
            }
            result = dispatch_pieces(&plan, &handles, &gate) => {
                if let Err(e) = result {
                    assembler.abort();
                    return Err(e);
                }
            }
        }

        debug!("All pieces dispatched, waiting for assembly");
        let result = join_result(assembler.await);
        drop(sessions);
        result
    }
}

/// Bring every session up, applying the failure policy
async fn connect_swarm(sessions: &mut Vec<PeerSession>, policy: PeerFailurePolicy) -> Result<Vec<PeerHandle>> {
    let mut handles = Vec::with_capacity(sessions.len());
    let mut failed = Vec::new();

    for (position, session) in sessions.iter_mut().enumerate() {
        match session.establish().await {
            Ok(handle) => handles.push(handle),
            Err(e) => match policy {
                PeerFailurePolicy::AbortSwarm => {
                    error!("Peer {} failed, aborting download: {}", session.contact(), e);
                    return Err(e);
                }
                PeerFailurePolicy::DropPeer => {
                    warn!("Dropping peer {}: {}", session.contact(), e);
                    failed.push(position);
                }
            },
        }
    }

    for position in failed.into_iter().rev() {
        sessions.remove(position);
    }

    if handles.is_empty() {
        return Err(TorrentError::peer_error("No peer session could be established").into());
    }
    info!("{} peer sessions established", handles.len());
    Ok(handles)
}

/// Request pieces in ascending order, one gate slot per piece, on every
/// peer
async fn dispatch_pieces(plan: &[(u32, u32)], handles: &[PeerHandle], gate: &ConcurrencyGate) -> Result<()> {
    for (index, &(length, block_size)) in plan.iter().enumerate() {
        let index = index as u32;
        if !gate.acquire(index).await? {
            debug!("Piece {} already complete, not requesting it", index);
            continue;
        }

        let mut announced = 0;
        for handle in handles {
            if handle.has_piece(index).await {
                announced += 1;
            }
        }
        debug!(
            "Dispatching piece {} to {} peers ({} announced it)",
            index,
            handles.len(),
            announced
        );
        for handle in handles {
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.request_piece(index, length, block_size).await {
                    warn!("Requests for piece {} to {} stopped: {}", index, handle.peer(), e);
                }
            });
        }
    }
    Ok(())
}

/// Drain the block queue until every piece is stored, then finish the file
async fn assemble(mut file: TargetFile, mut blocks: mpsc::Receiver<Block>, gate: Arc<ConcurrencyGate>) -> Result<()> {
    while !file.is_complete() {
        let block = match blocks.recv().await {
            Some(block) => block,
            None => {
                error!("All peer sessions ended with {} pieces missing", file.missing().len());
                return Err(TorrentError::peer_error(format!(
                    "All peer sessions ended with {} pieces missing",
                    file.missing().len()
                ))
                .into());
            }
        };

        if let BlockOutcome::PieceStored(index) = file.add_block(block).await? {
            gate.release(index);
        }
    }

    file.finish().await
}

fn join_result(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    result.map_err(|e| TorrentError::peer_error(format!("Assembly task failed: {}", e)))?
}
