//! Download progress of the whole torrent.
//!
//! Every piece is in exactly one of two places: it is either set in
//! `completed`, or it has a [`Piece`] in `outstanding`. Pieces move from the
//! latter to the former only after their hash is verified.

use std::collections::BTreeMap;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    metainfo::Metadata,
    piece::{Block, BlockStatus, Piece},
    tcp_wire::BlockInfo,
};

/// What happened to some piece data handed to [`TransferState::write_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The data doesn't continue any block we are waiting for, it must not
    /// be written.
    Ignored,
    /// Accepted, the block still misses bytes.
    Partial,
    /// Accepted, the block is now finished.
    BlockFinished,
    /// Accepted, and it was the last block of the piece. The piece must be
    /// hashed before it counts as completed.
    PieceFinished(u32),
}

#[derive(Debug, Clone)]
pub struct TransferState {
    /// Verified pieces.
    pub completed: Bitfield,
    /// Pieces that were picked by the scheduler or have data.
    pub in_progress: Bitfield,
    /// Every piece not completed, by index.
    pub outstanding: BTreeMap<u32, Piece>,
    block_len: u32,
    /// Pieces verified since the last [`TransferState::take_completed`].
    just_completed: Vec<u32>,
}

impl TransferState {
    /// Nothing downloaded yet.
    pub fn new(meta: &Metadata, block_len: u32) -> Self {
        Self::from_parts(
            meta,
            block_len,
            Bitfield::from_piece(meta.piece_count()),
            BTreeMap::new(),
        )
    }

    /// Every piece completed, used to seed.
    pub fn complete(meta: &Metadata, block_len: u32) -> Self {
        let mut completed = Bitfield::from_piece(meta.piece_count());
        completed.fill(true);
        Self::from_parts(meta, block_len, completed, BTreeMap::new())
    }

    /// Assemble a state from a completed set and some pieces in progress.
    ///
    /// Outstanding pieces that are also completed are dropped, and a fresh
    /// piece is created for every index found in neither.
    pub fn from_parts(
        meta: &Metadata,
        block_len: u32,
        mut completed: Bitfield,
        mut outstanding: BTreeMap<u32, Piece>,
    ) -> Self {
        let count = meta.piece_count();
        completed.resize(count, false);
        outstanding.retain(|i, _| (*i as usize) < count && !completed.has(*i as usize));

        let mut in_progress = Bitfield::from_piece(count);
        for index in 0..count as u32 {
            if completed.has(index as usize) {
                continue;
            }
            let piece = outstanding
                .entry(index)
                .or_insert_with(|| Piece::new(index, meta.piece_len(index), block_len));
            if piece.is_in_progress() {
                in_progress.set(index as usize, true);
            }
        }

        Self { completed, in_progress, outstanding, block_len, just_completed: Vec::new() }
    }

    pub fn block_len(&self) -> u32 {
        self.block_len
    }

    pub fn piece_count(&self) -> usize {
        self.completed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Bytes that still have to be verified.
    pub fn left(&self, meta: &Metadata) -> u64 {
        self.outstanding.keys().map(|i| meta.piece_len(*i) as u64).sum()
    }

    /// Whether the peer has at least one piece we didn't complete.
    pub fn needs(&self, peer_pieces: &Bitfield) -> bool {
        peer_pieces
            .iter_ones()
            .any(|i| i < self.piece_count() && !self.completed.has(i))
    }

    /// A connected peer advertised the piece.
    pub fn peer_has(&mut self, index: u32) {
        if let Some(piece) = self.outstanding.get_mut(&index) {
            piece.commonality += 1;
        }
    }

    /// A connected peer that advertised the piece is gone, or took it back.
    pub fn peer_lost(&mut self, index: u32) {
        if let Some(piece) = self.outstanding.get_mut(&index) {
            piece.commonality = piece.commonality.saturating_sub(1);
        }
    }

    /// Forget every piece advertised by a peer that is gone.
    pub fn peer_gone(&mut self, peer_pieces: &Bitfield) {
        for i in peer_pieces.iter_ones() {
            self.peer_lost(i as u32);
        }
    }

    pub fn block(&self, info: &BlockInfo) -> Option<&Block> {
        self.outstanding.get(&info.index)?.block(info)
    }

    pub fn block_mut(&mut self, info: &BlockInfo) -> Option<&mut Block> {
        self.outstanding.get_mut(&info.index)?.block_mut(info)
    }

    /// Give a block back to the pool, losing its partial data. Finished
    /// blocks are kept.
    pub fn release(&mut self, info: &BlockInfo) {
        if let Some(block) = self.block_mut(info) {
            if block.status != BlockStatus::Finished {
                block.reset();
            }
        }
    }

    /// Drain the pieces verified since the last call.
    pub fn take_completed(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.just_completed)
    }

    /// Account for `len` bytes of piece data received at `begin` inside
    /// piece `index`.
    ///
    /// The data must continue exactly where the block that contains `begin`
    /// stopped, and the block must have been requested. Anything but
    /// [`Progress::Ignored`] means the caller has to write the data.
    pub fn write_block(
        &mut self,
        index: u32,
        begin: u32,
        len: usize,
        now: Instant,
    ) -> Progress {
        let Some(piece) = self.outstanding.get_mut(&index) else {
            return Progress::Ignored;
        };
        let Some(bi) = piece.block_index(begin) else {
            return Progress::Ignored;
        };
        let block = &mut piece.blocks[bi];

        if !block.status.is_in_flight()
            || begin != block.cursor()
            || len == 0
            || len as u64 > block.remaining() as u64
        {
            debug!(
                "ignoring {len} bytes at {index}:{begin}, block is {:?} at {}",
                block.status,
                block.cursor()
            );
            return Progress::Ignored;
        }

        block.bytes_read += len as u32;
        if block.bytes_read == block.len {
            block.touch(BlockStatus::Finished, now);
        } else {
            block.touch(BlockStatus::Started, now);
        }
        let finished = block.status == BlockStatus::Finished;
        self.in_progress.set(index as usize, true);

        if !finished {
            Progress::Partial
        } else if piece.all_finished() {
            Progress::PieceFinished(index)
        } else {
            Progress::BlockFinished
        }
    }

    /// Writing the data at `begin` of piece `index` failed, the block that
    /// holds it has to be downloaded again. Returns that block.
    pub fn write_failed(&mut self, index: u32, begin: u32) -> Option<BlockInfo> {
        let piece = self.outstanding.get_mut(&index)?;
        let bi = piece.block_index(begin)?;
        let block = &mut piece.blocks[bi];
        block.reset();
        Some(BlockInfo { index, begin: block.offset, len: block.len })
    }

    /// The hash of a piece was checked against storage.
    ///
    /// On a match the piece becomes completed. Otherwise every block of the
    /// piece is reset.
    pub fn piece_checked(&mut self, index: u32, valid: bool) {
        let Some(piece) = self.outstanding.get_mut(&index) else {
            return;
        };

        self.in_progress.set(index as usize, false);
        if !valid {
            warn!("piece {index} failed verification, downloading it again");
            piece.reset();
            return;
        }

        self.outstanding.remove(&index);
        self.completed.set(index as usize, true);
        self.just_completed.push(index);
        info!(
            "piece {index} verified, {}/{} done",
            self.completed.count_ones(),
            self.piece_count()
        );
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        disk::{Disk, DiskMsg},
        storage::MemoryStorage,
        torrent::TorrentMsg,
    };

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn request(state: &mut TransferState, info: &BlockInfo, now: Instant) {
        state.block_mut(info).unwrap().touch(BlockStatus::Requested, now);
    }

    #[test]
    fn two_blocks_complete_a_piece() {
        let data = content(32768);
        let meta = Metadata::from_content("a", "", 32768, &data).unwrap();
        let mut state = TransferState::new(&meta, 16384);
        let now = Instant::now();

        let first = BlockInfo { index: 0, begin: 0, len: 16384 };
        let second = BlockInfo { index: 0, begin: 16384, len: 16384 };
        request(&mut state, &first, now);
        request(&mut state, &second, now);

        assert_eq!(state.write_block(0, 0, 16384, now), Progress::BlockFinished);
        assert!(state.in_progress.has(0));

        assert_eq!(state.write_block(0, 16384, 16384, now), Progress::PieceFinished(0));
        // not completed before the hash is checked
        assert!(!state.completed.has(0));
        assert!(state.outstanding[&0].all_finished());

        state.piece_checked(0, true);
        assert!(state.completed.has(0));
        assert!(!state.in_progress.has(0));
        assert!(state.is_complete());
        assert_eq!(state.take_completed(), vec![0]);
        assert!(state.take_completed().is_empty());

        // a late answer for the same piece changes nothing
        state.piece_checked(0, false);
        assert!(state.completed.has(0));
    }

    #[tokio::test]
    async fn single_block_pieces_end_to_end() {
        let data = content(32768);
        let meta = Metadata::from_content("a", "", 16384, &data).unwrap();
        let mut state = TransferState::new(&meta, 16384);
        let (mut disk, _ctx) = Disk::new(meta.clone(), MemoryStorage::new(32768));
        let now = Instant::now();

        assert_eq!(state.outstanding.len(), 2);
        for piece in state.outstanding.values() {
            assert_eq!(piece.blocks.len(), 1);
            assert_eq!((piece.blocks[0].offset, piece.blocks[0].len), (0, 16384));
        }

        for index in 0..2u32 {
            let info = BlockInfo { index, begin: 0, len: 16384 };
            request(&mut state, &info, now);

            let start = index as usize * 16384;
            let bytes = Bytes::copy_from_slice(&data[start..start + 16384]);
            assert_eq!(state.write_block(index, 0, bytes.len(), now), Progress::PieceFinished(index));

            assert!(disk.handle(DiskMsg::WriteBlock { index, begin: 0, data: bytes }).await.is_none());
            match disk.handle(DiskMsg::ValidatePiece(index)).await {
                Some(TorrentMsg::PieceChecked { index, valid }) => state.piece_checked(index, valid),
                other => panic!("expected a hash check, got {other:?}"),
            }
        }

        assert_eq!(state.completed.iter_ones().collect::<Vec<_>>(), vec![0, 1]);
        assert!(state.outstanding.is_empty());
        assert_eq!(disk.storage.data, data);
    }

    #[test]
    fn corrupted_block_resets_the_piece() {
        let data = content(32768);
        let meta = Metadata::from_content("a", "", 32768, &data).unwrap();
        let mut state = TransferState::new(&meta, 16384);
        let now = Instant::now();

        let first = BlockInfo { index: 0, begin: 0, len: 16384 };
        let second = BlockInfo { index: 0, begin: 16384, len: 16384 };
        request(&mut state, &first, now);
        request(&mut state, &second, now);

        state.write_block(0, 0, 16384, now);
        assert_eq!(state.write_block(0, 16384, 16384, now), Progress::PieceFinished(0));
        state.piece_checked(0, false);

        assert!(!state.completed.has(0));
        assert!(!state.in_progress.has(0));
        assert!(state.take_completed().is_empty());
        let piece = &state.outstanding[&0];
        assert!(piece
            .blocks
            .iter()
            .all(|b| b.status == BlockStatus::Unassigned && b.bytes_read == 0));
    }

    #[test]
    fn split_block_data() {
        let data = content(20000);
        let meta = Metadata::from_content("a", "", 16384, &data).unwrap();
        let mut state = TransferState::new(&meta, 16384);
        let now = Instant::now();

        // the last piece is a single short block
        let info = BlockInfo { index: 1, begin: 0, len: 20000 - 16384 };
        request(&mut state, &info, now);

        assert_eq!(state.write_block(1, 0, 616, now), Progress::Partial);
        assert_eq!(state.block(&info).unwrap().status, BlockStatus::Started);

        // not contiguous
        assert_eq!(state.write_block(1, 1000, 616, now), Progress::Ignored);
        // longer than what is left
        assert_eq!(state.write_block(1, 616, 3001, now), Progress::Ignored);

        // the rest of the block
        assert_eq!(state.write_block(1, 616, 3000, now), Progress::PieceFinished(1));
        assert!(!state.completed.has(0));
    }

    #[test]
    fn unrequested_data_is_ignored() {
        let data = content(16384);
        let meta = Metadata::from_content("a", "", 16384, &data).unwrap();
        let mut state = TransferState::new(&meta, 16384);

        assert_eq!(state.write_block(0, 0, 16384, Instant::now()), Progress::Ignored);
        assert_eq!(state.block(&BlockInfo::new()).unwrap().bytes_read, 0);

        // unknown piece
        assert_eq!(state.write_block(9, 0, 16384, Instant::now()), Progress::Ignored);
    }

    #[test]
    fn write_failure_releases_the_block() {
        let data = content(32768);
        let meta = Metadata::from_content("a", "", 32768, &data).unwrap();
        let mut state = TransferState::new(&meta, 16384);
        let now = Instant::now();

        let info = BlockInfo { index: 0, begin: 16384, len: 16384 };
        request(&mut state, &info, now);
        assert_eq!(state.write_block(0, 16384, 1000, now), Progress::Partial);

        // reported for the first part of the block
        assert_eq!(state.write_failed(0, 16384), Some(info));
        let block = state.block(&info).unwrap();
        assert_eq!(block.status, BlockStatus::Unassigned);
        assert_eq!(block.bytes_read, 0);

        // the rest of the data is not accepted anymore
        assert_eq!(state.write_block(0, 17384, 1000, now), Progress::Ignored);
        assert_eq!(state.write_failed(7, 0), None);
    }

    #[test]
    fn from_parts_keeps_pieces_disjoint() {
        let data = content(16384 * 4);
        let meta = Metadata::from_content("a", "", 16384, &data).unwrap();

        let mut completed = Bitfield::from_piece(4);
        completed.set(1, true);

        let mut started = Piece::new(2, 16384, 8192);
        started.blocks[0].status = BlockStatus::Finished;
        started.blocks[0].bytes_read = 8192;

        let mut outstanding = BTreeMap::new();
        outstanding.insert(1, Piece::new(1, 16384, 8192));
        outstanding.insert(2, started);

        let state = TransferState::from_parts(&meta, 8192, completed, outstanding);

        assert_eq!(state.outstanding.keys().copied().collect::<Vec<_>>(), vec![0, 2, 3]);
        assert!(state.in_progress.has(2));
        assert!(!state.in_progress.has(0));
        assert_eq!(state.left(&meta), 3 * 16384);
        for i in 0..4u32 {
            assert_ne!(state.completed.has(i as usize), state.outstanding.contains_key(&i));
        }
    }

    #[test]
    fn rarity_and_interest() {
        let data = content(16384 * 3);
        let meta = Metadata::from_content("a", "", 16384, &data).unwrap();
        let mut state = TransferState::new(&meta, 16384);
        state.completed.set(0, true);
        state.outstanding.remove(&0);

        let mut peer = Bitfield::from_piece(3);
        peer.set(0, true);
        assert!(!state.needs(&peer));

        peer.set(2, true);
        assert!(state.needs(&peer));

        for i in peer.iter_ones() {
            state.peer_has(i as u32);
        }
        assert_eq!(state.outstanding[&2].commonality, 1);

        state.peer_gone(&peer);
        state.peer_gone(&peer);
        assert_eq!(state.outstanding[&2].commonality, 0);
    }

    #[test]
    fn release_keeps_finished_blocks() {
        let data = content(32768);
        let meta = Metadata::from_content("a", "", 32768, &data).unwrap();
        let mut state = TransferState::new(&meta, 16384);
        let now = Instant::now();

        let first = BlockInfo { index: 0, begin: 0, len: 16384 };
        let second = BlockInfo { index: 0, begin: 16384, len: 16384 };
        state.block_mut(&first).unwrap().touch(BlockStatus::Finished, now);
        state.block_mut(&second).unwrap().touch(BlockStatus::Started, now);

        state.release(&first);
        state.release(&second);
        assert_eq!(state.block(&first).unwrap().status, BlockStatus::Finished);
        assert_eq!(state.block(&second).unwrap().status, BlockStatus::Unassigned);
    }
}
