//! Units of work flowing between the queue, workers and result consumers

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::protocol::{PeerMessage, copy_piece_data};
use super::{PieceIndex, TorrentDescriptor, TorrentError};

/// One piece waiting to be downloaded.
///
/// Owned by exactly one place at a time: the work queue or the worker that
/// dequeued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    pub index: PieceIndex,
    pub expected_hash: [u8; 20],
    pub length: u32,
}

impl PieceWork {
    /// One work item per piece, in index order.
    pub fn all_pieces(descriptor: &TorrentDescriptor) -> Vec<PieceWork> {
        descriptor
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                let index = PieceIndex::new(index as u32);
                PieceWork {
                    index,
                    expected_hash: *hash,
                    length: descriptor.piece_size(index),
                }
            })
            .collect()
    }
}

/// A verified piece on its way to the output buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    pub index: PieceIndex,
    pub data: Bytes,
}

/// Progress of a single attempt at one piece on one connection.
#[derive(Debug)]
pub struct PieceProgress {
    index: PieceIndex,
    buffer: Vec<u8>,
    downloaded: u32,
    requested: u32,
    backlog: usize,
}

impl PieceProgress {
    pub fn new(work: &PieceWork) -> Self {
        Self {
            index: work.index,
            buffer: vec![0u8; work.length as usize],
            downloaded: 0,
            requested: 0,
            backlog: 0,
        }
    }

    pub fn length(&self) -> u32 {
        self.buffer.len() as u32
    }

    pub fn downloaded(&self) -> u32 {
        self.downloaded
    }

    pub fn requested(&self) -> u32 {
        self.requested
    }

    /// Requests sent but not yet answered.
    pub fn backlog(&self) -> usize {
        self.backlog
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.length()
    }

    /// Whether another request fits in the pipeline.
    pub fn wants_request(&self, max_backlog: usize) -> bool {
        self.backlog < max_backlog && self.requested < self.length()
    }

    /// Reserves the next block and returns its `(offset, length)`.
    ///
    /// Every block is `block_size` except the last, which holds the remainder.
    pub fn next_block(&mut self, block_size: u32) -> (u32, u32) {
        let offset = self.requested;
        let length = block_size.min(self.length() - self.requested);
        self.requested += length;
        self.backlog += 1;
        (offset, length)
    }

    /// Stores the block from a `piece` message and retires one outstanding request.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Wrong piece index or block outside the piece
    pub fn record_block(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        let copied = copy_piece_data(self.index, &mut self.buffer, message)?;
        self.downloaded += copied as u32;
        self.backlog = self.backlog.saturating_sub(1);
        Ok(())
    }

    /// Checks the assembled bytes against the expected SHA-1.
    ///
    /// # Errors
    /// - `TorrentError::PieceHashMismatch` - Data does not hash to `expected_hash`
    pub fn verify(&self, expected_hash: &[u8; 20]) -> Result<(), TorrentError> {
        if verify_piece_hash(&self.buffer, expected_hash) {
            Ok(())
        } else {
            Err(TorrentError::PieceHashMismatch { index: self.index })
        }
    }

    pub fn into_result(self) -> PieceResult {
        PieceResult {
            index: self.index,
            data: Bytes::from(self.buffer),
        }
    }
}

/// Verifies piece data against expected hash.
pub fn verify_piece_hash(piece_data: &[u8], expected_hash: &[u8; 20]) -> bool {
    let computed: [u8; 20] = Sha1::digest(piece_data).into();
    computed == *expected_hash
}
