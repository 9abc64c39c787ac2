//! Piece and block model
//!
//! A piece collects the blocks received for it, keyed by offset, and is
//! the unit that gets hashed and persisted.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};
use tracing::{debug, trace, warn};

/// A contiguous slice of a piece as delivered by a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Piece index this block belongs to
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    /// Block payload
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(piece_index: u32, offset: u32, data: Vec<u8>) -> Self {
        Self {
            piece_index,
            offset,
            data,
        }
    }

    /// Offset one past the last byte of this block
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.data.len() as u64
    }
}

/// What the completion policy decided after a block was merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceProgress {
    /// More blocks are needed before the piece can be judged
    Pending,
    /// The piece hashed correctly and can be persisted
    Verified,
    /// Every expected block arrived but the hash does not match
    Corrupt,
}

/// A fixed-size, hash-addressed unit of the target file
#[derive(Debug, Clone)]
pub struct Piece {
    /// Piece index
    pub index: u32,
    /// Exact byte length of this piece
    pub length: u32,
    /// Request granularity for this piece
    pub block_size: u32,
    /// Whether this is the last piece of the file
    pub is_final: bool,
    /// Expected SHA-1 of the piece content
    pub hash: [u8; 20],
    /// Received blocks keyed by offset
    blocks: BTreeMap<u32, Vec<u8>>,
    /// Highest offset+length seen so far
    size: u64,
    /// Set once the piece was verified and written
    completed: bool,
}

impl Piece {
    pub fn new(index: u32, length: u32, block_size: u32, is_final: bool, hash: [u8; 20]) -> Self {
        Self {
            index,
            length,
            block_size: block_size.max(1),
            is_final,
            hash,
            blocks: BTreeMap::new(),
            size: 0,
            completed: false,
        }
    }

    /// Merge a block into the piece. A block at an offset already present
    /// replaces the previous data.
    pub fn add_block(&mut self, block: Block) {
        let end = block.end();
        if self.blocks.insert(block.offset, block.data).is_some() {
            trace!("Piece {}: overwrote block at offset {}", self.index, block.offset);
        }
        self.size = self.size.max(end);
    }

    /// Hash the concatenated blocks in offset order and compare against the
    /// expected digest
    pub fn check(&self) -> bool {
        let mut hasher = Sha1::new();
        for data in self.blocks.values() {
            hasher.update(data);
        }
        let digest = hasher.finalize();
        digest.as_slice() == self.hash
    }

    /// Number of blocks needed to cover the piece, counting a trailing short
    /// block
    pub fn expected_blocks(&self) -> usize {
        ((self.length as u64 + self.block_size as u64 - 1) / self.block_size as u64) as usize
    }

    /// Number of distinct blocks received
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the stored block count has reached the expected count
    pub fn is_fully_counted(&self) -> bool {
        self.block_count() >= self.expected_blocks()
    }

    /// High-water mark of received bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Apply the completion policy to the current block set.
    ///
    /// The final piece is accepted as soon as its hash matches, whatever its
    /// block count. Every other piece is judged only once fully counted. A
    /// mismatch on a fully counted piece is reported as corrupt; a mismatch
    /// on a partially received final piece keeps it pending.
    pub fn progress(&self) -> PieceProgress {
        let counted = self.is_fully_counted();
        if !self.is_final && !counted {
            return PieceProgress::Pending;
        }

        if self.check() {
            debug!("Piece {} verified ({} blocks)", self.index, self.block_count());
            PieceProgress::Verified
        } else if counted {
            warn!("Piece {} failed verification with all {} blocks present", self.index, self.block_count());
            PieceProgress::Corrupt
        } else {
            trace!("Final piece {} not yet matching, waiting for more blocks", self.index);
            PieceProgress::Pending
        }
    }

    /// Concatenated piece content in offset order
    pub fn data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.size as usize);
        for block in self.blocks.values() {
            data.extend_from_slice(block);
        }
        data
    }

    /// Drop the block buffers and mark the piece as done
    pub fn free(&mut self) {
        self.blocks.clear();
        self.completed = true;
    }

    /// Whether a block matches one of the requests planned for this piece:
    /// aligned to `block_size` and exactly as long as that request.
    pub fn accepts(&self, block: &Block) -> bool {
        if block.piece_index != self.index || block.offset >= self.length {
            return false;
        }
        let expected = self.block_size.min(self.length - block.offset);
        block.offset % self.block_size == 0 && block.data.len() as u64 == expected as u64
    }
}

/// Request plan for a piece: `(begin, length)` for every block in order
pub fn block_requests(length: u32, block_size: u32) -> Vec<(u32, u32)> {
    let block_size = block_size.max(1);
    let mut requests = Vec::new();
    let mut begin = 0u32;
    while begin < length {
        let len = block_size.min(length - begin);
        requests.push((begin, len));
        begin += len;
    }
    requests
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn piece_for(content: &[u8], block_size: u32, is_final: bool) -> Piece {
        Piece::new(0, content.len() as u32, block_size, is_final, sha1(content))
    }

    fn blocks_of(content: &[u8], block_size: usize) -> Vec<Block> {
        content
            .chunks(block_size)
            .enumerate()
            .map(|(i, chunk)| Block::new(0, (i * block_size) as u32, chunk.to_vec()))
            .collect()
    }

    #[test]
    fn test_merge_order_does_not_matter() {
        let content: Vec<u8> = (0u8..12).collect();
        let blocks = blocks_of(&content, 4);
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        for order in orders {
            let mut piece = piece_for(&content, 4, false);
            for i in order {
                piece.add_block(blocks[i].clone());
            }
            assert!(piece.check(), "order {:?} failed", order);
            assert_eq!(piece.data(), content);
            assert_eq!(piece.size(), 12);
        }
    }

    #[test]
    fn test_duplicate_offset_last_write_wins() {
        let content = b"abcdefgh".to_vec();
        let mut piece = piece_for(&content, 4, false);
        piece.add_block(Block::new(0, 0, b"zzzz".to_vec()));
        piece.add_block(Block::new(0, 4, b"efgh".to_vec()));
        assert!(!piece.check());

        piece.add_block(Block::new(0, 0, b"abcd".to_vec()));
        assert_eq!(piece.block_count(), 2);
        assert!(piece.check());
    }

    #[test]
    fn test_single_flipped_byte_fails_check() {
        let content: Vec<u8> = (0u8..16).collect();
        let mut piece = piece_for(&content, 8, false);
        let mut blocks = blocks_of(&content, 8);
        blocks[1].data[3] ^= 0x01;
        for block in blocks {
            piece.add_block(block);
        }
        assert!(!piece.check());
        assert_eq!(piece.progress(), PieceProgress::Corrupt);
    }

    #[test]
    fn test_expected_blocks_rounds_up() {
        let piece = Piece::new(0, 10, 4, false, [0u8; 20]);
        assert_eq!(piece.expected_blocks(), 3);
        let piece = Piece::new(0, 8, 4, false, [0u8; 20]);
        assert_eq!(piece.expected_blocks(), 2);
    }

    #[test]
    fn test_non_final_piece_waits_for_all_blocks() {
        let content = b"abcdefgh".to_vec();
        let mut piece = piece_for(&content, 4, false);
        piece.add_block(Block::new(0, 0, b"abcd".to_vec()));
        assert_eq!(piece.progress(), PieceProgress::Pending);
        piece.add_block(Block::new(0, 4, b"efgh".to_vec()));
        assert_eq!(piece.progress(), PieceProgress::Verified);
    }

    #[test]
    fn test_final_piece_accepted_on_hash_match() {
        // Final piece with a 1-byte block size but delivered as one block
        let content = b"xy".to_vec();
        let mut piece = piece_for(&content, 1, true);
        piece.add_block(Block::new(0, 0, content.clone()));
        assert_eq!(piece.block_count(), 1);
        assert_eq!(piece.progress(), PieceProgress::Verified);
    }

    #[test]
    fn test_partial_final_piece_mismatch_is_pending() {
        let content = b"wxyz".to_vec();
        let mut piece = piece_for(&content, 1, true);
        piece.add_block(Block::new(0, 0, b"w".to_vec()));
        assert_eq!(piece.progress(), PieceProgress::Pending);
    }

    #[test]
    fn test_free_clears_blocks() {
        let content = b"abcd".to_vec();
        let mut piece = piece_for(&content, 4, false);
        piece.add_block(Block::new(0, 0, content));
        piece.free();
        assert!(piece.is_completed());
        assert_eq!(piece.block_count(), 0);
    }

    #[test]
    fn test_accepts_rejects_overflowing_block() {
        let piece = Piece::new(3, 8, 4, false, [0u8; 20]);
        assert!(piece.accepts(&Block::new(3, 4, vec![0; 4])));
        assert!(!piece.accepts(&Block::new(3, 6, vec![0; 4])));
        assert!(!piece.accepts(&Block::new(3, 8, vec![0; 4])));
        assert!(!piece.accepts(&Block::new(2, 0, vec![0; 4])));
    }

    #[test]
    fn test_accepts_only_planned_requests() {
        let piece = Piece::new(0, 10, 4, false, [0u8; 20]);
        for (begin, len) in block_requests(10, 4) {
            assert!(piece.accepts(&Block::new(0, begin, vec![0; len as usize])));
        }
        // misaligned, short and oversized blocks
        assert!(!piece.accepts(&Block::new(0, 1, vec![0; 2])));
        assert!(!piece.accepts(&Block::new(0, 4, vec![0; 2])));
        assert!(!piece.accepts(&Block::new(0, 8, vec![0; 1])));
        assert!(!piece.accepts(&Block::new(0, 0, vec![0; 8])));
    }

    #[test]
    fn test_block_requests_short_tail() {
        assert_eq!(block_requests(10, 4), vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(block_requests(8, 4), vec![(0, 4), (4, 4)]);
        assert!(block_requests(0, 4).is_empty());
    }
}
