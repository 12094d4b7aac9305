//! BitTorrent handshake serialization and exchange

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{PROTOCOL_STRING, PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Handshake size on the wire: `1 + 19 + 8 + 20 + 20`.
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake as `0x13 ‖ "BitTorrent protocol" ‖ reserved ‖ info_hash ‖ peer_id`.
    pub fn serialize_handshake(handshake: &PeerHandshake) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&handshake.reserved);
        buf[28..48].copy_from_slice(handshake.info_hash.as_bytes());
        buf[48..68].copy_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Deserializes a 68-byte handshake.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Wrong length marker or protocol string
    pub fn deserialize_handshake(data: &[u8; HANDSHAKE_LEN]) -> Result<PeerHandshake, TorrentError> {
        if data[0] as usize != PROTOCOL_STRING.len() {
            return Err(TorrentError::ProtocolError {
                message: format!("Invalid protocol string length {}", data[0]),
            });
        }

        if &data[1..20] != PROTOCOL_STRING {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Unsupported protocol {:?}",
                    String::from_utf8_lossy(&data[1..20])
                ),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(PeerHandshake {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}

/// Writes our handshake, reads the peer's and checks it names the same torrent.
///
/// # Errors
/// - `TorrentError::PeerConnectionError` - Transport failure during the exchange
/// - `TorrentError::ProtocolError` - Malformed handshake or info hash mismatch
pub async fn exchange_handshake<S>(
    stream: &mut S,
    ours: &PeerHandshake,
) -> Result<PeerHandshake, TorrentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&HandshakeCodec::serialize_handshake(ours))
        .await
        .map_err(|e| TorrentError::PeerConnectionError {
            reason: format!("Failed to send handshake: {e}"),
        })?;

    let mut response = [0u8; HANDSHAKE_LEN];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| TorrentError::PeerConnectionError {
            reason: format!("Failed to read handshake response: {e}"),
        })?;

    let theirs = HandshakeCodec::deserialize_handshake(&response)?;
    if theirs.info_hash != ours.info_hash {
        return Err(TorrentError::ProtocolError {
            message: format!(
                "Info hash mismatch in handshake: expected {}, got {}",
                ours.info_hash, theirs.info_hash
            ),
        });
    }

    Ok(theirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(info: u8, peer: u8) -> PeerHandshake {
        PeerHandshake::new(InfoHash::new([info; 20]), PeerId::new([peer; 20]))
    }

    #[test]
    fn test_wire_layout() {
        let bytes = HandshakeCodec::serialize_handshake(&handshake(1, 2));

        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[test]
    fn test_rejects_wrong_length_marker() {
        let mut bytes = HandshakeCodec::serialize_handshake(&handshake(1, 2));
        bytes[0] = 18;

        let result = HandshakeCodec::deserialize_handshake(&bytes);
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[test]
    fn test_rejects_foreign_protocol() {
        let mut bytes = HandshakeCodec::serialize_handshake(&handshake(1, 2));
        bytes[1..20].copy_from_slice(b"BitTorrent protocoI");

        let result = HandshakeCodec::deserialize_handshake(&bytes);
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_exchange_returns_remote_handshake() {
        let ours = handshake(7, 1);
        let theirs = handshake(7, 9);

        let mut stream = tokio_test::io::Builder::new()
            .write(&HandshakeCodec::serialize_handshake(&ours))
            .read(&HandshakeCodec::serialize_handshake(&theirs))
            .build();

        let received = exchange_handshake(&mut stream, &ours).await.unwrap();
        assert_eq!(received.peer_id, PeerId::new([9u8; 20]));
    }

    #[tokio::test]
    async fn test_exchange_rejects_info_hash_mismatch() {
        let ours = handshake(7, 1);
        let theirs = handshake(8, 9);

        let mut stream = tokio_test::io::Builder::new()
            .write(&HandshakeCodec::serialize_handshake(&ours))
            .read(&HandshakeCodec::serialize_handshake(&theirs))
            .build();

        let result = exchange_handshake(&mut stream, &ours).await;
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_short_response_is_transport_failure() {
        let ours = handshake(7, 1);

        let mut stream = tokio_test::io::Builder::new()
            .write(&HandshakeCodec::serialize_handshake(&ours))
            .read(&[19, b'B', b'i'])
            .build();

        let result = exchange_handshake(&mut stream, &ours).await;
        assert!(matches!(
            result,
            Err(TorrentError::PeerConnectionError { .. })
        ));
    }
}
