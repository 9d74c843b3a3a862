//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait BitfieldExt {
    /// An empty bitfield for a torrent with `pieces` pieces.
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Out of range indices read as `false`.
    fn has(&self, index: usize) -> bool;
}

impl BitfieldExt for Bitfield {
    fn has(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }
}

/// Bytes of a bitfield as sent on the wire, MSB first within each byte and
/// with the spare bits of the last byte set to zero.
pub fn to_wire_bytes(bitfield: &Bitfield) -> Vec<u8> {
    let mut out = vec![0u8; bitfield.len().div_ceil(8)];
    for i in bitfield.iter_ones() {
        out[i / 8] |= 0x80 >> (i % 8);
    }
    out
}
