//! In-flight transfer state of a single piece and of its blocks.

use std::{fmt::Display, str::FromStr};

use tokio::time::Instant;

use crate::tcp_wire::BlockInfo;

/// Lifecycle of a block:
/// `Unassigned -> Unrequested -> Requested -> Started -> Finished`.
///
/// A block goes back to `Unassigned` when the peer holding it is dropped,
/// chokes us, times out, or when its piece fails verification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlockStatus {
    /// Nobody is going to request it.
    #[default]
    Unassigned,
    /// Queued in the send queue of a peer, not on the wire yet.
    Unrequested,
    /// A request was sent.
    Requested,
    /// Some of its bytes arrived.
    Started,
    /// Every byte arrived and was written to storage.
    Finished,
}

impl BlockStatus {
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Requested | Self::Started)
    }
}

impl Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unassigned => "Unassigned",
            Self::Unrequested => "Unrequested",
            Self::Requested => "Requested",
            Self::Started => "Started",
            Self::Finished => "Finished",
        };
        f.write_str(s)
    }
}

impl FromStr for BlockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Unassigned" => Self::Unassigned,
            "Unrequested" => Self::Unrequested,
            "Requested" => Self::Requested,
            "Started" => Self::Started,
            "Finished" => Self::Finished,
            other => return Err(format!("unknown block status `{other}`")),
        })
    }
}

/// The smallest unit transferred on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub piece: u32,
    /// Offset of the block inside its piece.
    pub offset: u32,
    pub len: u32,
    pub status: BlockStatus,
    /// Bytes of this block already written to storage.
    pub bytes_read: u32,
    /// Last time the status or `bytes_read` changed.
    pub modified: Option<Instant>,
}

impl Block {
    pub fn new(piece: u32, offset: u32, len: u32) -> Self {
        Self {
            piece,
            offset,
            len,
            status: BlockStatus::Unassigned,
            bytes_read: 0,
            modified: None,
        }
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo { index: self.piece, begin: self.offset, len: self.len }
    }

    /// Back to `Unassigned`, dropping any partial data.
    pub fn reset(&mut self) {
        self.status = BlockStatus::Unassigned;
        self.bytes_read = 0;
        self.modified = None;
    }

    pub fn touch(&mut self, status: BlockStatus, now: Instant) {
        self.status = status;
        self.modified = Some(now);
    }

    /// Offset inside the piece where the next byte is expected.
    pub fn cursor(&self) -> u32 {
        self.offset + self.bytes_read
    }

    pub fn remaining(&self) -> u32 {
        self.len - self.bytes_read
    }
}

/// An ordered, fixed partition of a piece into blocks. Adjacency is
/// positional: block `i + 1` starts where block `i` ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Piece {
    pub index: u32,
    pub blocks: Vec<Block>,
    /// How many connected peers advertised this piece.
    pub commonality: u32,
}

impl Piece {
    /// Split a piece of `piece_len` bytes in blocks of `block_len`, the last
    /// block might be smaller.
    pub fn new(index: u32, piece_len: u32, block_len: u32) -> Self {
        let block_len = block_len.max(1);
        let count = piece_len.div_ceil(block_len);
        let blocks = (0..count)
            .map(|i| {
                let offset = i * block_len;
                Block::new(index, offset, block_len.min(piece_len - offset))
            })
            .collect();

        Self { index, blocks, commonality: 0 }
    }

    /// Rebuild a piece from its blocks, sorted by offset.
    pub fn from_blocks(index: u32, mut blocks: Vec<Block>) -> Self {
        blocks.sort_by_key(|b| b.offset);
        Self { index, blocks, commonality: 0 }
    }

    pub fn all_finished(&self) -> bool {
        self.blocks.iter().all(|b| b.status == BlockStatus::Finished)
    }

    /// At least one block has data.
    pub fn is_in_progress(&self) -> bool {
        self.blocks.iter().any(|b| {
            matches!(b.status, BlockStatus::Started | BlockStatus::Finished)
        })
    }

    pub fn has_unassigned(&self) -> bool {
        self.blocks.iter().any(|b| b.status == BlockStatus::Unassigned)
    }

    /// Index of the block that contains the byte at `begin`.
    pub fn block_index(&self, begin: u32) -> Option<usize> {
        let i = self.blocks.partition_point(|b| b.offset <= begin);
        let i = i.checked_sub(1)?;
        let block = &self.blocks[i];
        (begin < block.offset + block.len).then_some(i)
    }

    /// The block described exactly by `info`.
    pub fn block(&self, info: &BlockInfo) -> Option<&Block> {
        let i = self.block_index(info.begin)?;
        let block = &self.blocks[i];
        (block.offset == info.begin && block.len == info.len).then_some(block)
    }

    pub fn block_mut(&mut self, info: &BlockInfo) -> Option<&mut Block> {
        let i = self.block_index(info.begin)?;
        let block = &mut self.blocks[i];
        (block.offset == info.begin && block.len == info.len).then_some(block)
    }

    /// Every block back to `Unassigned`, no partial credit.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.reset();
        }
    }

    /// Whether the blocks cover `[0, piece_len)` with no gap or overlap.
    pub fn is_partition(&self, piece_len: u32) -> bool {
        let mut cursor = 0u32;
        for block in &self.blocks {
            if block.piece != self.index
                || block.offset != cursor
                || block.len == 0
                || block.bytes_read > block.len
            {
                return false;
            }
            cursor = match cursor.checked_add(block.len) {
                Some(c) => c,
                None => return false,
            };
        }
        cursor == piece_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_for_many_layouts() {
        let triples: [(u64, u32, u32); 8] = [
            (32768, 16384, 16384),
            (40000, 16384, 16384),
            (1, 16384, 16384),
            (100_000, 32768, 16384),
            (100_001, 32768, 10_000),
            (262_144, 262_144, 16384),
            (5, 2, 1),
            (999_999, 65536, 3000),
        ];

        for (file_len, piece_len, block_len) in triples {
            let pieces = file_len.div_ceil(piece_len as u64) as u32;
            let mut covered = 0u64;

            for index in 0..pieces {
                let start = index as u64 * piece_len as u64;
                let len = (file_len - start).min(piece_len as u64) as u32;
                let piece = Piece::new(index, len, block_len);

                assert!(piece.is_partition(len), "{file_len} {piece_len} {block_len}");
                assert!(piece.blocks.iter().all(|b| b.len <= block_len));
                assert_eq!(piece.blocks.iter().map(|b| b.len).sum::<u32>(), len);
                covered += len as u64;
            }

            assert_eq!(covered, file_len);
        }
    }

    #[test]
    fn block_lookup() {
        let piece = Piece::new(0, 40000, 16384);
        assert_eq!(piece.blocks.len(), 3);
        assert_eq!(piece.blocks[2].len, 40000 - 32768);

        assert_eq!(piece.block_index(0), Some(0));
        assert_eq!(piece.block_index(16383), Some(0));
        assert_eq!(piece.block_index(16384), Some(1));
        assert_eq!(piece.block_index(39999), Some(2));
        assert_eq!(piece.block_index(40000), None);

        let info = BlockInfo { index: 0, begin: 16384, len: 16384 };
        assert_eq!(piece.block(&info).unwrap().offset, 16384);

        // not the exact block
        let info = BlockInfo { index: 0, begin: 16384, len: 100 };
        assert!(piece.block(&info).is_none());
    }

    #[test]
    fn broken_partitions() {
        let mut piece = Piece::new(3, 32768, 16384);
        assert!(piece.is_partition(32768));
        assert!(!piece.is_partition(32769));

        piece.blocks.remove(0);
        assert!(!piece.is_partition(32768));

        let overlap = Piece::from_blocks(
            3,
            vec![Block::new(3, 0, 20000), Block::new(3, 16384, 16384)],
        );
        assert!(!overlap.is_partition(32768));
    }

    #[test]
    fn progress_and_reset() {
        let now = Instant::now();
        let mut piece = Piece::new(0, 32768, 16384);
        assert!(!piece.is_in_progress());
        assert!(piece.has_unassigned());

        piece.blocks[0].touch(BlockStatus::Requested, now);
        assert!(!piece.is_in_progress());

        piece.blocks[0].touch(BlockStatus::Started, now);
        piece.blocks[0].bytes_read = 10;
        assert!(piece.is_in_progress());
        assert_eq!(piece.blocks[0].cursor(), 10);

        piece.blocks[0].touch(BlockStatus::Finished, now);
        piece.blocks[1].touch(BlockStatus::Finished, now);
        assert!(piece.all_finished());

        piece.reset();
        assert!(piece.blocks.iter().all(|b| b.status == BlockStatus::Unassigned
            && b.bytes_read == 0
            && b.modified.is_none()));
    }

    #[test]
    fn status_text() {
        for status in [
            BlockStatus::Unassigned,
            BlockStatus::Unrequested,
            BlockStatus::Requested,
            BlockStatus::Started,
            BlockStatus::Finished,
        ] {
            assert_eq!(status.to_string().parse::<BlockStatus>(), Ok(status));
        }
        assert!("Done".parse::<BlockStatus>().is_err());
    }
}
