//! Torrent descriptor and the parser interface

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;

use super::super::{InfoHash, PieceIndex, TorrentError};

/// Everything the download engine needs to know about a single-file torrent.
///
/// Immutable once parsed; shared between workers behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TorrentDescriptor {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    #[serde(serialize_with = "serialize_piece_hashes")]
    pub piece_hashes: Vec<[u8; 20]>,
    pub announce_urls: Vec<String>,
}

impl TorrentDescriptor {
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte range `[begin, end)` of a piece within the assembled file.
    ///
    /// `end` is clamped to the total length, so only the last piece can be short.
    pub fn piece_bounds(&self, index: PieceIndex) -> (u64, u64) {
        let begin = u64::from(index.as_u32()) * u64::from(self.piece_length);
        let end = (begin + u64::from(self.piece_length)).min(self.total_length);
        (begin, end.max(begin))
    }

    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let (begin, end) = self.piece_bounds(index);
        (end - begin) as u32
    }

    /// Expected SHA-1 of a piece, if the index is in range.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index.as_usize())
    }

    /// Checks that piece length, total length and hash count agree.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Inconsistent geometry
    pub fn validate(&self) -> Result<(), TorrentError> {
        let invalid = |reason: String| Err(TorrentError::InvalidTorrentFile { reason });

        if self.piece_length == 0 {
            return invalid("Piece length must be positive".to_string());
        }
        if self.total_length == 0 || self.piece_hashes.is_empty() {
            return invalid("Torrent contains no pieces".to_string());
        }

        let expected = self.total_length.div_ceil(u64::from(self.piece_length));
        if expected != self.piece_hashes.len() as u64 {
            return invalid(format!(
                "Expected {expected} piece hashes for {} bytes in {}-byte pieces, found {}",
                self.total_length,
                self.piece_length,
                self.piece_hashes.len()
            ));
        }
        if expected > u64::from(u32::MAX) {
            return invalid(format!("Too many pieces: {expected}"));
        }

        Ok(())
    }
}

fn serialize_piece_hashes<S: serde::Serializer>(
    hashes: &[[u8; 20]],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(hashes.iter().map(hex::encode))
}

/// Abstract torrent parsing interface.
///
/// Turns metainfo into a validated `TorrentDescriptor`.
#[async_trait]
pub trait TorrentParser: Send + Sync {
    /// Parses torrent metadata from raw bencode bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Missing or inconsistent fields
    /// - `TorrentError::Bencode` - Malformed bencode
    async fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentDescriptor, TorrentError>;

    /// Reads a .torrent file from disk and parses it.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File could not be read
    /// - `TorrentError::InvalidTorrentFile` - Parsing failure
    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentDescriptor, TorrentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(piece_length: u32, total_length: u64, pieces: usize) -> TorrentDescriptor {
        TorrentDescriptor {
            info_hash: InfoHash::new([0u8; 20]),
            name: "test.bin".to_string(),
            piece_length,
            total_length,
            piece_hashes: vec![[0u8; 20]; pieces],
            announce_urls: Vec::new(),
        }
    }

    #[test]
    fn test_short_last_piece_bounds() {
        let descriptor = descriptor(262144, 300000, 2);

        assert!(descriptor.validate().is_ok());
        assert_eq!(descriptor.piece_count(), 2);
        assert_eq!(descriptor.piece_bounds(PieceIndex::new(0)), (0, 262144));
        assert_eq!(descriptor.piece_bounds(PieceIndex::new(1)), (262144, 300000));
        assert_eq!(descriptor.piece_size(PieceIndex::new(0)), 262144);
        assert_eq!(descriptor.piece_size(PieceIndex::new(1)), 37856);
    }

    #[test]
    fn test_exact_multiple_has_no_short_piece() {
        let descriptor = descriptor(16384, 65536, 4);

        assert!(descriptor.validate().is_ok());
        assert_eq!(descriptor.piece_size(PieceIndex::new(3)), 16384);
        assert_eq!(descriptor.piece_size(PieceIndex::new(4)), 0);
    }

    #[test]
    fn test_validate_rejects_inconsistent_geometry() {
        assert!(descriptor(0, 100, 1).validate().is_err());
        assert!(descriptor(16384, 0, 0).validate().is_err());
        assert!(descriptor(16384, 16385, 1).validate().is_err());
        assert!(descriptor(16384, 16384, 2).validate().is_err());
    }

    #[test]
    fn test_serializes_hashes_as_hex() {
        let mut descriptor = descriptor(4, 4, 1);
        descriptor.piece_hashes = vec![[0xAB; 20]];

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["piece_hashes"][0], "ab".repeat(20));
        assert_eq!(json["info_hash"], "0".repeat(40));
        assert_eq!(json["total_length"], 4);
    }
}
