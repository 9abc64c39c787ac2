//! Target file assembly
//!
//! [`TargetFile`] owns every [`Piece`] of the download, the set of pieces
//! still missing and the backend the verified data is written to.

use std::collections::BTreeSet;

use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::storage::backend::StorageBackend;
use crate::storage::piece::{Block, Piece, PieceProgress};
use crate::torrent::TorrentInfo;

/// Divisor applied to the block size for the last piece
pub const FINAL_BLOCK_DIVISOR: u32 = 4;

/// Missing pieces are listed individually in the log below this count
const MISSING_REPORT_THRESHOLD: usize = 10;

/// Outcome of feeding one block into the target file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block merged, piece still incomplete
    Buffered,
    /// Piece verified and written; carries the piece index
    PieceStored(u32),
    /// Block discarded (completed piece or out-of-range block)
    Ignored,
}

/// The file being downloaded
pub struct TargetFile {
    name: String,
    size: u64,
    piece_length: u64,
    pieces: Vec<Piece>,
    missing: BTreeSet<u32>,
    backend: Box<dyn StorageBackend>,
    finished: bool,
}

impl std::fmt::Debug for TargetFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("piece_length", &self.piece_length)
            .field("missing", &self.missing.len())
            .field("backend", &self.backend.location())
            .finish()
    }
}

impl TargetFile {
    /// Build the piece table for a file of `size` bytes.
    ///
    /// Every piece but the last is `piece_length` long and requested in
    /// `block_size` blocks; the last piece covers the remainder and uses a
    /// quarter of the block size.
    pub fn new(
        name: impl Into<String>,
        size: u64,
        piece_length: u64,
        hashes: &[[u8; 20]],
        block_size: u32,
        backend: Box<dyn StorageBackend>,
    ) -> Result<Self> {
        let name = name.into();
        if piece_length == 0 || piece_length > u32::MAX as u64 {
            return Err(TorrentError::validation_error_with_field("Invalid piece length", "piece_length").into());
        }
        if hashes.is_empty() {
            return Err(TorrentError::validation_error_with_field("Torrent has no pieces", "pieces").into());
        }
        let count = hashes.len() as u64;
        if size <= (count - 1) * piece_length || size > count * piece_length {
            error!("File size {} does not fit {} pieces of {} bytes", size, count, piece_length);
            return Err(TorrentError::validation_error_with_field(
                format!("File size {} does not fit {} pieces of {} bytes", size, count, piece_length),
                "length",
            )
            .into());
        }

        let final_block_size = (block_size / FINAL_BLOCK_DIVISOR).max(1);
        let pieces: Vec<Piece> = hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                let is_final = index as u64 == count - 1;
                let (length, block) = if is_final {
                    (size - index as u64 * piece_length, final_block_size)
                } else {
                    (piece_length, block_size)
                };
                Piece::new(index as u32, length as u32, block, is_final, *hash)
            })
            .collect();

        let missing = (0..count as u32).collect();
        info!("Target file {}: {} bytes in {} pieces", name, size, count);

        Ok(Self {
            name,
            size,
            piece_length,
            pieces,
            missing,
            backend,
            finished: false,
        })
    }

    /// Build the piece table straight from a torrent descriptor
    pub fn from_torrent(info: &TorrentInfo, block_size: u32, backend: Box<dyn StorageBackend>) -> Result<Self> {
        Self::new(info.name.clone(), info.length, info.piece_length, &info.pieces, block_size, backend)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, index: u32) -> Option<&Piece> {
        self.pieces.get(index as usize)
    }

    /// Indices of pieces not yet stored, ascending
    pub fn missing(&self) -> &BTreeSet<u32> {
        &self.missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Byte offset of a piece in the target file
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length
    }

    /// Merge a block and apply the completion policy to its piece.
    ///
    /// Verified pieces are written, freed and marked finished before this
    /// returns. A fully counted piece that fails its hash is an integrity
    /// error.
    pub async fn add_block(&mut self, block: Block) -> Result<BlockOutcome> {
        let index = block.piece_index;
        let piece = match self.pieces.get_mut(index as usize) {
            Some(piece) => piece,
            None => {
                warn!("Discarding block for unknown piece {}", index);
                return Ok(BlockOutcome::Ignored);
            }
        };

        if piece.is_completed() {
            trace!("Piece {} already stored, dropping block at offset {}", index, block.offset);
            return Ok(BlockOutcome::Ignored);
        }
        if !piece.accepts(&block) {
            warn!(
                "Discarding unrequested block at offset {} ({} bytes) for piece {} of {} bytes",
                block.offset,
                block.data.len(),
                index,
                piece.length
            );
            return Ok(BlockOutcome::Ignored);
        }

        piece.add_block(block);
        match piece.progress() {
            PieceProgress::Pending => Ok(BlockOutcome::Buffered),
            PieceProgress::Corrupt => {
                error!("Piece {} is corrupt", index);
                Err(TorrentError::integrity_error("Piece hash mismatch", index).into())
            }
            PieceProgress::Verified => {
                self.store_piece(index).await?;
                self.mark_piece_finished(index);
                Ok(BlockOutcome::PieceStored(index))
            }
        }
    }

    /// Write a piece's content at `index * piece_length` and free its blocks
    pub async fn store_piece(&mut self, index: u32) -> Result<()> {
        let offset = self.piece_offset(index);
        let piece = self.pieces.get_mut(index as usize).ok_or_else(|| {
            TorrentError::validation_error_with_field(format!("Invalid piece index {}", index), "piece_index")
        })?;

        let data = piece.data();
        debug!("Storing piece {} at offset {} ({} bytes)", index, offset, data.len());
        self.backend.write_at(offset, &data).await.map_err(|e| {
            error!("Failed to store piece {}: {}", index, e);
            TorrentError::storage_error_full("Failed to store piece", self.backend.location(), e.to_string())
        })?;
        piece.free();
        Ok(())
    }

    /// Remove a piece from the missing set
    pub fn mark_piece_finished(&mut self, index: u32) {
        if !self.missing.remove(&index) {
            trace!("Piece {} was already finished", index);
            return;
        }

        let remaining = self.missing.len();
        info!("Piece {} finished, {} remaining", index, remaining);
        if remaining > 0 && remaining < MISSING_REPORT_THRESHOLD {
            debug!("Missing pieces: {:?}", self.missing);
        }
    }

    /// Truncate to the declared size and move the file to its final name.
    /// Only valid once, after every piece has been stored.
    pub async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(TorrentError::storage_error_with_path("File already finished", self.name.clone()).into());
        }
        if !self.missing.is_empty() {
            return Err(TorrentError::storage_error_with_path(
                format!("Cannot finish with {} pieces missing", self.missing.len()),
                self.name.clone(),
            )
            .into());
        }

        self.backend.finalize(self.size).await?;
        self.finished = true;
        info!("Download of {} complete ({} bytes)", self.name, self.size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::{FileBackend, MemoryBackend};
    use sha1::{Digest, Sha1};

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn hashes(content: &[u8], piece_length: usize) -> Vec<[u8; 20]> {
        content.chunks(piece_length).map(sha1).collect()
    }

    const CONTENT: &[u8] = b"0123456789";

    fn ten_byte_file(backend: Box<dyn StorageBackend>) -> TargetFile {
        TargetFile::new("ten", 10, 4, &hashes(CONTENT, 4), 2, backend).unwrap()
    }

    #[test]
    fn test_piece_layout() {
        let file = ten_byte_file(Box::new(MemoryBackend::new()));
        assert_eq!(file.piece_count(), 3);
        assert_eq!(file.piece(0).unwrap().length, 4);
        assert_eq!(file.piece(1).unwrap().length, 4);
        let last = file.piece(2).unwrap();
        assert_eq!(last.length, 2);
        assert!(last.is_final);
        assert_eq!(last.block_size, 1);
        assert_eq!(file.piece(0).unwrap().block_size, 2);
    }

    #[test]
    fn test_rejects_inconsistent_size() {
        let h = hashes(CONTENT, 4);
        assert!(TargetFile::new("x", 8, 4, &h, 2, Box::new(MemoryBackend::new())).is_err());
        assert!(TargetFile::new("x", 13, 4, &h, 2, Box::new(MemoryBackend::new())).is_err());
        assert!(TargetFile::new("x", 10, 0, &h, 2, Box::new(MemoryBackend::new())).is_err());
        assert!(TargetFile::new("x", 10, 4, &[], 2, Box::new(MemoryBackend::new())).is_err());
    }

    #[tokio::test]
    async fn test_completing_first_piece_shrinks_missing() {
        let mut file = ten_byte_file(Box::new(MemoryBackend::new()));
        assert_eq!(file.missing().iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);

        let first = file.add_block(Block::new(0, 0, b"01".to_vec())).await.unwrap();
        assert_eq!(first, BlockOutcome::Buffered);
        let second = file.add_block(Block::new(0, 2, b"23".to_vec())).await.unwrap();
        assert_eq!(second, BlockOutcome::PieceStored(0));

        assert_eq!(file.missing().iter().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_pieces_written_at_fixed_stride() {
        let backend = MemoryBackend::new();
        let view = backend.clone();
        let mut file = ten_byte_file(Box::new(backend));

        // Final piece first, in 1-byte blocks
        assert_eq!(file.add_block(Block::new(2, 0, b"8".to_vec())).await.unwrap(), BlockOutcome::Buffered);
        assert_eq!(file.add_block(Block::new(2, 1, b"9".to_vec())).await.unwrap(), BlockOutcome::PieceStored(2));
        assert_eq!(&view.contents().await[8..10], b"89");

        file.add_block(Block::new(1, 2, b"67".to_vec())).await.unwrap();
        file.add_block(Block::new(1, 0, b"45".to_vec())).await.unwrap();
        assert_eq!(&view.contents().await[4..8], b"4567");
    }

    #[tokio::test]
    async fn test_completed_piece_ignores_late_blocks() {
        let mut file = ten_byte_file(Box::new(MemoryBackend::new()));
        file.add_block(Block::new(0, 0, b"01".to_vec())).await.unwrap();
        file.add_block(Block::new(0, 2, b"23".to_vec())).await.unwrap();

        let late = file.add_block(Block::new(0, 2, b"23".to_vec())).await.unwrap();
        assert_eq!(late, BlockOutcome::Ignored);
        assert_eq!(file.missing().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_full_piece_is_integrity_error() {
        let mut file = ten_byte_file(Box::new(MemoryBackend::new()));
        file.add_block(Block::new(1, 0, b"45".to_vec())).await.unwrap();
        let err = file.add_block(Block::new(1, 2, b"6X".to_vec())).await.unwrap_err();
        let err = err.downcast::<TorrentError>().unwrap();
        assert!(matches!(err, TorrentError::IntegrityError { piece: Some(1), .. }));
        assert!(file.missing().contains(&1));
    }

    #[tokio::test]
    async fn test_out_of_range_blocks_are_ignored() {
        let mut file = ten_byte_file(Box::new(MemoryBackend::new()));
        assert_eq!(file.add_block(Block::new(9, 0, b"00".to_vec())).await.unwrap(), BlockOutcome::Ignored);
        assert_eq!(file.add_block(Block::new(0, 3, b"00".to_vec())).await.unwrap(), BlockOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_unrequested_offset_does_not_count_toward_piece() {
        let mut file = ten_byte_file(Box::new(MemoryBackend::new()));
        // correct bytes, but at an offset that was never requested
        assert_eq!(file.add_block(Block::new(0, 1, b"12".to_vec())).await.unwrap(), BlockOutcome::Ignored);
        assert_eq!(file.add_block(Block::new(0, 0, b"0".to_vec())).await.unwrap(), BlockOutcome::Ignored);

        assert_eq!(file.add_block(Block::new(0, 0, b"01".to_vec())).await.unwrap(), BlockOutcome::Buffered);
        assert_eq!(file.add_block(Block::new(0, 2, b"23".to_vec())).await.unwrap(), BlockOutcome::PieceStored(0));
    }

    #[tokio::test]
    async fn test_finish_requires_all_pieces() {
        let mut file = ten_byte_file(Box::new(MemoryBackend::new()));
        assert!(file.finish().await.is_err());
    }

    #[tokio::test]
    async fn test_finish_produces_exact_size_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::create(dir.path(), "ten").await.unwrap();
        let mut file = ten_byte_file(Box::new(backend));

        for (index, chunk) in CONTENT.chunks(4).enumerate() {
            let block_size = file.piece(index as u32).unwrap().block_size as usize;
            for (i, block) in chunk.chunks(block_size).enumerate() {
                let offset = (i * block_size) as u32;
                file.add_block(Block::new(index as u32, offset, block.to_vec())).await.unwrap();
            }
        }
        assert!(file.is_complete());
        file.finish().await.unwrap();
        assert!(file.finish().await.is_err());

        let written = std::fs::read(dir.path().join("ten")).unwrap();
        assert_eq!(written, CONTENT);
        assert!(!dir.path().join("ten.part").exists());
    }
}
