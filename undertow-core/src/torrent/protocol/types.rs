//! Core types and enumerations for BitTorrent wire protocol

use std::fmt;

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol identifier carried in every handshake.
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker communication to identify clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate a random peer ID carrying the default client prefix.
    pub fn generate() -> Self {
        Self::generate_with_prefix("-UT0001-")
    }

    /// Generate a peer ID whose leading bytes are `prefix`, random after that.
    ///
    /// Prefixes longer than 20 bytes are truncated.
    pub fn generate_with_prefix(prefix: &str) -> Self {
        let mut id: [u8; 20] = rand::random();
        let prefix = &prefix.as_bytes()[..prefix.len().min(20)];
        id[..prefix.len()].copy_from_slice(prefix);
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// BitTorrent wire protocol messages.
///
/// The nine message kinds of the peer wire protocol plus keep-alive.
/// Identifiers this client does not understand surface as `Unknown` so
/// callers can skip them instead of tearing the connection down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length frame
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Peer acquired a piece
    Have { piece_index: PieceIndex },
    /// Complete availability bitmap, sent once after the handshake
    Bitfield { bitfield: Bytes },
    /// Ask for `length` bytes of a piece starting at `offset`
    Request {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// One block of piece data
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// Message with an identifier outside 0..=8
    Unknown { id: u8, payload: Bytes },
}

impl PeerMessage {
    /// Wire identifier, or `None` for keep-alive.
    pub fn id(&self) -> Option<u8> {
        match self {
            PeerMessage::KeepAlive => None,
            PeerMessage::Choke => Some(0),
            PeerMessage::Unchoke => Some(1),
            PeerMessage::Interested => Some(2),
            PeerMessage::NotInterested => Some(3),
            PeerMessage::Have { .. } => Some(4),
            PeerMessage::Bitfield { .. } => Some(5),
            PeerMessage::Request { .. } => Some(6),
            PeerMessage::Piece { .. } => Some(7),
            PeerMessage::Cancel { .. } => Some(8),
            PeerMessage::Unknown { id, .. } => Some(*id),
        }
    }

    /// Short name for log output.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
            PeerMessage::Unknown { .. } => "unknown",
        }
    }
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and verify both sides are talking about the same torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandshake {
    /// Reserved bytes for protocol extensions, always zero when we send
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Peer connection lifecycle.
///
/// `Handshaking -> AwaitingBitfield -> Ready`, with any failure moving
/// straight to `Closed`. The TCP connect stage runs inside
/// [`PeerConnection::connect`](super::PeerConnection::connect) before a
/// connection value exists, so it has no state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Exchanging handshakes
    Handshaking,
    /// Waiting for the mandatory first bitfield
    AwaitingBitfield,
    /// Authenticated and ready for requests
    Ready,
    /// Transport or protocol failure; the connection is unusable
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate();
        assert_eq!(&peer_id.as_bytes()[..8], b"-UT0001-");

        let peer_id2 = PeerId::generate();
        assert_ne!(peer_id.as_bytes(), peer_id2.as_bytes());
    }

    #[test]
    fn test_custom_prefix_is_truncated() {
        let peer_id = PeerId::generate_with_prefix("-XX0042-and-a-very-long-suffix");
        assert_eq!(&peer_id.as_bytes()[..], b"-XX0042-and-a-very-l");
    }

    #[test]
    fn test_message_ids() {
        assert_eq!(PeerMessage::KeepAlive.id(), None);
        assert_eq!(PeerMessage::Choke.id(), Some(0));
        assert_eq!(
            PeerMessage::Cancel {
                piece_index: PieceIndex::new(0),
                offset: 0,
                length: 1,
            }
            .id(),
            Some(8)
        );
        assert_eq!(
            PeerMessage::Unknown {
                id: 20,
                payload: Bytes::new(),
            }
            .id(),
            Some(20)
        );
    }

    #[test]
    fn test_handshake_reserved_is_zero() {
        let handshake = PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::new([2u8; 20]));
        assert_eq!(handshake.reserved, [0u8; 8]);
    }
}
