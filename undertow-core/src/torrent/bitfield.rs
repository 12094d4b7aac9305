//! Compact record of which pieces a remote peer has

use std::fmt;

use bytes::Bytes;

use super::PieceIndex;

/// Bitfield representing which pieces a peer has.
///
/// Bit `i` lives in byte `i / 8` at position `7 - (i % 8)`, most
/// significant bit first, as required on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Create new empty bitfield for given number of pieces
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0u8; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Create bitfield from a peer's raw `bitfield` payload.
    ///
    /// Short payloads are padded with zeros, long ones truncated, and spare
    /// bits past `piece_count` are cleared so they never read as available.
    pub fn from_bytes(piece_data: Bytes, piece_count: usize) -> Self {
        let mut bits = piece_data.to_vec();
        bits.resize(piece_count.div_ceil(8), 0);

        let mut bitfield = Self { bits, piece_count };
        bitfield.clear_spare_bits();
        bitfield
    }

    /// Create a bitfield with every piece available.
    pub fn full(piece_count: usize) -> Self {
        let mut bitfield = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bitfield.clear_spare_bits();
        bitfield
    }

    /// Check if peer has specific piece
    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_usize();
        if index >= self.piece_count {
            return false;
        }

        let bit_index = 7 - (index % 8);
        (self.bits[index / 8] >> bit_index) & 1 == 1
    }

    /// Mark piece as available (set bit)
    pub fn set_piece(&mut self, piece_index: PieceIndex) {
        let index = piece_index.as_usize();
        if index >= self.piece_count {
            return;
        }

        let bit_index = 7 - (index % 8);
        self.bits[index / 8] |= 1 << bit_index;
    }

    /// Count total number of pieces this peer has
    pub fn count(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// Returns true when every piece is marked available.
    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Number of pieces this bitfield covers.
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Get raw bytes for transmission
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Iterates over the indices of available pieces in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.piece_count)
            .map(|index| PieceIndex::new(index as u32))
            .filter(|&index| self.has_piece(index))
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0
            && let Some(last) = self.bits.last_mut()
        {
            *last &= 0xFF << spare;
        }
    }
}

impl fmt::Display for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (position, index) in self.iter_set().enumerate() {
            if position > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{index}")?;
        }
        f.write_str("}")
    }
}
