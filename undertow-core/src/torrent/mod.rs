//! BitTorrent protocol implementation and piece download engine

pub mod bitfield;
pub mod coordinator;
pub mod output;
pub mod parsing;
pub mod piece;
pub mod protocol;
pub mod scheduler;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_data;
pub mod tracker;
pub mod work_queue;

use std::fmt;
use std::time::Duration;

pub use bitfield::Bitfield;
pub use coordinator::{
    CompletedDownload, DownloadCoordinator, DownloadReport, PeerSource, StaticPeerSource,
    TrackerPeerSource,
};
pub use output::OutputBuffer;
pub use parsing::{BencodeError, BencodeTorrentParser, TorrentDescriptor, TorrentParser, Value};
pub use piece::{PieceProgress, PieceResult, PieceWork};
pub use protocol::{PeerConnection, PeerHandshake, PeerId, PeerMessage, PeerState};
pub use scheduler::{PieceScheduler, WorkerExit};
pub use tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, HttpTrackerClient, TrackerClient};
pub use work_queue::WorkQueue;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl serde::Serialize for InfoHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index widened for slice and bitfield addressing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Covers metainfo parsing, tracker discovery, peer transport and protocol
/// failures, piece verification, and download-level termination.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("Tracker connection failed: {url}")]
    TrackerConnectionFailed { url: String },

    #[error("Tracker request timed out: {url}")]
    TrackerTimeout { url: String },

    #[error("Tracker server error {status}: {url}")]
    TrackerServerError { url: String, status: u16 },

    #[error("Tracker rejected announce: {reason}")]
    TrackerRejected { reason: String },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Peer timed out during {stage} after {after:?}")]
    PeerTimeout { stage: &'static str, after: Duration },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Piece {index} hash mismatch")]
    PieceHashMismatch { index: PieceIndex },

    #[error("Download deadline exceeded with {completed}/{total} pieces complete")]
    DownloadTimeout { completed: usize, total: usize },

    #[error("No usable peers left with {completed}/{total} pieces complete")]
    PeersExhausted { completed: usize, total: usize },

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}

impl TorrentError {
    /// Returns true when a peer broke the wire protocol rather than the transport.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, TorrentError::ProtocolError { .. })
    }

    /// Returns true for socket failures and per-connection deadlines.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            TorrentError::PeerConnectionError { .. }
                | TorrentError::PeerTimeout { .. }
                | TorrentError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
        assert_eq!(piece2.as_usize(), 10);
    }

    #[test]
    fn test_error_classification() {
        let protocol = TorrentError::ProtocolError {
            message: "bad frame".to_string(),
        };
        let timeout = TorrentError::PeerTimeout {
            stage: "handshake",
            after: Duration::from_secs(3),
        };
        assert!(protocol.is_protocol_violation());
        assert!(!protocol.is_transport_failure());
        assert!(timeout.is_transport_failure());
        assert!(!timeout.is_protocol_violation());
    }
}
