//! Shared output buffer for verified pieces

use std::mem;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use super::{PieceIndex, PieceResult, TorrentDescriptor, TorrentError};

/// File-sized buffer split into one independently locked region per piece.
///
/// Result consumers write concurrently; since regions never overlap, two
/// writers only contend if they deliver the same piece.
#[derive(Debug)]
pub struct OutputBuffer {
    regions: Vec<Mutex<BytesMut>>,
    total_length: u64,
}

impl OutputBuffer {
    /// Allocates a zeroed buffer laid out like `descriptor`'s pieces.
    pub fn new(descriptor: &TorrentDescriptor) -> Self {
        let mut whole = BytesMut::zeroed(descriptor.total_length as usize);
        let regions = (0..descriptor.piece_count())
            .map(|index| {
                let size = descriptor.piece_size(PieceIndex::new(index as u32)) as usize;
                Mutex::new(whole.split_to(size))
            })
            .collect();

        Self {
            regions,
            total_length: descriptor.total_length,
        }
    }

    /// Copies a verified piece into its region.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Unknown index or data length differs from the piece size
    pub fn write(&self, result: &PieceResult) -> Result<(), TorrentError> {
        let region = self
            .regions
            .get(result.index.as_usize())
            .ok_or_else(|| TorrentError::ProtocolError {
                message: format!("Piece {} is outside the output buffer", result.index),
            })?;

        let mut region = region.lock();
        if region.len() != result.data.len() {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Piece {} has {} bytes, expected {}",
                    result.index,
                    result.data.len(),
                    region.len()
                ),
            });
        }
        region.copy_from_slice(&result.data);
        Ok(())
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Joins all regions back into one contiguous buffer.
    ///
    /// Regions were split from one allocation in order, so `unsplit` rejoins
    /// them without copying. Call once all pieces are written; the buffer is
    /// left empty.
    pub fn assemble(&self) -> Bytes {
        let mut whole = BytesMut::with_capacity(0);
        for region in &self.regions {
            whole.unsplit(mem::take(&mut *region.lock()));
        }
        whole.freeze()
    }
}
