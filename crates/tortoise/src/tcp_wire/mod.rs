//! The "TCP Wire" protocol between peers: the handshake and the
//! length-prefixed core messages.
pub mod codec;
pub mod handshake_codec;

pub use codec::{CoreCodec, Message, MessageId};
pub use handshake_codec::{Handshake, HandshakeCodec};

use bytes::{BufMut, Bytes, BytesMut};

/// The default block_len that most clients support, some clients drop
/// the connection on blocks larger than this value.
///
/// The last block of a piece might be smaller.
pub const BLOCK_LEN: u32 = 16384;

/// Protocol String
/// String identifier of the string "BitTorrent protocol", in bytes.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// A Block is a subset of a Piece, pieces are subsets of the entire Torrent
/// data.
///
/// When peers send data (seed) to us, they send us Blocks. This happens on
/// the "Piece" message of the peer wire protocol. A single block may arrive
/// split across several "Piece" messages, each carrying a contiguous slice.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    /// The index of the piece this block belongs to.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The data. 16 KiB most of the times, but the last block of a piece
    /// *might* be smaller.
    pub block: Bytes,
}

impl Block {
    /// Encodes the block in the network binary protocol's format into the
    /// given buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.extend_from_slice(&self.block);
    }
}

/// The representation of a [`Block`].
///
/// When we ask a peer to give us a [`Block`], we send this struct, using the
/// "Request" message of the tcp wire protocol. It is also what a "Cancel"
/// carries and what blocks are keyed by in the request queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes.
    pub len: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl From<&Block> for BlockInfo {
    fn from(val: &Block) -> Self {
        BlockInfo {
            index: val.index,
            begin: val.begin,
            len: val.block.len() as u32,
        }
    }
}

impl BlockInfo {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }
    pub fn begin(mut self, begin: u32) -> Self {
        self.begin = begin;
        self
    }
    pub fn len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }

    /// Encodes the block info in the network binary protocol's format into
    /// the given buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }

    /// Whether the range `[begin, begin + len)` is non-empty and fits inside
    /// a piece of `piece_len` bytes.
    pub fn fits(&self, piece_len: u32) -> bool {
        self.len > 0
            && (self.begin as u64 + self.len as u64) <= piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_info_fits_piece() {
        let info = BlockInfo::new().index(0).begin(0).len(16384);
        assert!(info.fits(16384));

        // begin + len exceeds the piece bound
        let info = BlockInfo::new().begin(16384).len(16384);
        assert!(!info.fits(16384));

        // zero length requests are never valid
        let info = BlockInfo::new().len(0);
        assert!(!info.fits(16384));

        // shorter last piece
        let info = BlockInfo::new().begin(0).len(100);
        assert!(info.fits(100));
        assert!(!info.fits(99));

        // no overflow on absurd values
        let info = BlockInfo::new().begin(u32::MAX).len(u32::MAX);
        assert!(!info.fits(u32::MAX));
    }

    #[test]
    fn pstr_is_the_protocol_string() {
        assert_eq!(PSTR.len(), 19);
        assert_eq!(
            PSTR,
            [
                66, 105, 116, 84, 111, 114, 114, 101, 110, 116, 32, 112, 114,
                111, 116, 111, 99, 111, 108
            ]
        );
    }
}
