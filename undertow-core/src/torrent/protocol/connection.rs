//! Authenticated peer connection with per-connection negotiated state

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;

use super::handshake::exchange_handshake;
use super::messages::{MessageCodec, write_message};
use super::types::{PeerHandshake, PeerId, PeerMessage, PeerState};
use crate::config::NetworkConfig;
use crate::torrent::{Bitfield, PieceIndex, TorrentError};

const READ_BUFFER_CAPACITY: usize = 32 * 1024;

/// A live connection to one remote peer.
///
/// Created only through the full connect, handshake and bitfield sequence,
/// so every value handed out is in `Ready` state. Any transport or protocol
/// failure moves it to `Closed`, after which it should be dropped.
///
/// Frames are read through an internal buffer, which makes `read_message`
/// safe to race against a timer without losing bytes mid-frame.
pub struct PeerConnection<S = TcpStream> {
    stream: S,
    address: SocketAddr,
    state: PeerState,
    choked: bool,
    bitfield: Bitfield,
    remote_peer_id: Option<PeerId>,
    read_buffer: BytesMut,
}

impl PeerConnection<TcpStream> {
    /// Connects over TCP and runs the handshake and bitfield exchange.
    ///
    /// # Errors
    /// - `TorrentError::PeerTimeout` - Connect, handshake or bitfield deadline expired
    /// - `TorrentError::PeerConnectionError` - Transport failure
    /// - `TorrentError::ProtocolError` - Handshake mismatch or missing bitfield
    pub async fn connect(
        address: SocketAddr,
        handshake: &PeerHandshake,
        piece_count: usize,
        config: &NetworkConfig,
    ) -> Result<Self, TorrentError> {
        tracing::debug!("Connecting to peer {}", address);

        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(address))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("Failed to connect to {address}: {e}"),
                });
            }
            Err(_) => {
                return Err(TorrentError::PeerTimeout {
                    stage: "connect",
                    after: config.connect_timeout,
                });
            }
        };

        Self::establish(stream, address, handshake, piece_count, config).await
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Runs the handshake and waits for the mandatory bitfield on an open transport.
    ///
    /// # Errors
    /// - `TorrentError::PeerTimeout` - Handshake or bitfield deadline expired
    /// - `TorrentError::PeerConnectionError` - Transport failure
    /// - `TorrentError::ProtocolError` - Handshake mismatch or first message not a bitfield
    pub async fn establish(
        stream: S,
        address: SocketAddr,
        handshake: &PeerHandshake,
        piece_count: usize,
        config: &NetworkConfig,
    ) -> Result<Self, TorrentError> {
        let mut connection = Self {
            stream,
            address,
            state: PeerState::Handshaking,
            choked: true,
            bitfield: Bitfield::new(piece_count),
            remote_peer_id: None,
            read_buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        };

        let result = connection
            .negotiate(handshake, config.handshake_timeout, config.bitfield_timeout)
            .await;
        if let Err(e) = result {
            connection.state = PeerState::Closed;
            return Err(e);
        }

        tracing::debug!(
            "Peer {} ready with {}/{} pieces",
            address,
            connection.bitfield.count(),
            piece_count
        );
        Ok(connection)
    }

    async fn negotiate(
        &mut self,
        handshake: &PeerHandshake,
        handshake_timeout: Duration,
        bitfield_timeout: Duration,
    ) -> Result<(), TorrentError> {
        let remote = tokio::time::timeout(
            handshake_timeout,
            exchange_handshake(&mut self.stream, handshake),
        )
        .await
        .map_err(|_| TorrentError::PeerTimeout {
            stage: "handshake",
            after: handshake_timeout,
        })??;
        self.remote_peer_id = Some(remote.peer_id);
        self.state = PeerState::AwaitingBitfield;

        let bitfield = tokio::time::timeout(bitfield_timeout, self.await_bitfield())
            .await
            .map_err(|_| TorrentError::PeerTimeout {
                stage: "bitfield",
                after: bitfield_timeout,
            })??;
        self.bitfield = Bitfield::from_bytes(bitfield, self.bitfield.piece_count());
        self.state = PeerState::Ready;
        Ok(())
    }

    async fn await_bitfield(&mut self) -> Result<bytes::Bytes, TorrentError> {
        loop {
            match self.read_frame().await? {
                PeerMessage::KeepAlive => continue,
                PeerMessage::Bitfield { bitfield } => return Ok(bitfield),
                other => {
                    return Err(TorrentError::ProtocolError {
                        message: format!("Expected bitfield after handshake, got {}", other.kind()),
                    });
                }
            }
        }
    }

    /// Reads the next message and applies its effect on connection state.
    ///
    /// `choke`/`unchoke` flip the choked flag and `have` marks the piece in
    /// the remote bitfield. The message is returned either way.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Transport failure or peer hung up
    /// - `TorrentError::ProtocolError` - Malformed frame
    pub async fn read_message(&mut self) -> Result<PeerMessage, TorrentError> {
        let message = match self.read_frame().await {
            Ok(message) => message,
            Err(e) => {
                self.state = PeerState::Closed;
                return Err(e);
            }
        };

        match &message {
            PeerMessage::Choke => self.choked = true,
            PeerMessage::Unchoke => self.choked = false,
            PeerMessage::Have { piece_index } => self.apply_have(*piece_index),
            _ => {}
        }

        tracing::trace!("Peer {} sent {}", self.address, message.kind());
        Ok(message)
    }

    async fn read_frame(&mut self) -> Result<PeerMessage, TorrentError> {
        loop {
            if let Some(message) = MessageCodec::decode_frame(&mut self.read_buffer)? {
                return Ok(message);
            }

            let read = self
                .stream
                .read_buf(&mut self.read_buffer)
                .await
                .map_err(|e| TorrentError::PeerConnectionError {
                    reason: format!("Failed to read from {}: {e}", self.address),
                })?;

            if read == 0 {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("Peer {} closed the connection", self.address),
                });
            }
        }
    }

    async fn send(&mut self, message: PeerMessage) -> Result<(), TorrentError> {
        if self.state == PeerState::Closed {
            return Err(TorrentError::PeerConnectionError {
                reason: format!("Connection to {} is closed", self.address),
            });
        }

        if let Err(e) = write_message(&mut self.stream, &message).await {
            self.state = PeerState::Closed;
            return Err(e);
        }
        Ok(())
    }

    /// Tells the peer we want its pieces.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn send_interested(&mut self) -> Result<(), TorrentError> {
        self.send(PeerMessage::Interested).await
    }

    /// Tells the peer it may request from us.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn send_unchoke(&mut self) -> Result<(), TorrentError> {
        self.send(PeerMessage::Unchoke).await
    }

    /// Requests one block of a piece.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn send_request(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<(), TorrentError> {
        self.send(PeerMessage::Request {
            piece_index,
            offset,
            length,
        })
        .await
    }

    /// Announces a verified piece.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn send_have(&mut self, piece_index: PieceIndex) -> Result<(), TorrentError> {
        self.send(PeerMessage::Have { piece_index }).await
    }

    /// Records that the peer acquired a piece.
    pub fn apply_have(&mut self, piece_index: PieceIndex) {
        self.bitfield.set_piece(piece_index);
    }

    /// Whether the peer reported having `piece_index`.
    pub fn remote_has(&self, piece_index: PieceIndex) -> bool {
        self.bitfield.has_piece(piece_index)
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn remote_peer_id(&self) -> Option<PeerId> {
        self.remote_peer_id
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio_test::io::Builder;

    use super::*;
    use crate::torrent::InfoHash;
    use crate::torrent::protocol::handshake::HandshakeCodec;

    fn address() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    fn ours() -> PeerHandshake {
        PeerHandshake::new(InfoHash::new([3u8; 20]), PeerId::new([1u8; 20]))
    }

    fn theirs() -> PeerHandshake {
        PeerHandshake::new(InfoHash::new([3u8; 20]), PeerId::new([9u8; 20]))
    }

    fn frame(message: PeerMessage) -> Bytes {
        MessageCodec::serialize_message(&message)
    }

    fn bitfield(bits: &'static [u8]) -> Bytes {
        frame(PeerMessage::Bitfield {
            bitfield: Bytes::from_static(bits),
        })
    }

    #[tokio::test]
    async fn test_establish_reaches_ready() {
        let stream = Builder::new()
            .write(&HandshakeCodec::serialize_handshake(&ours()))
            .read(&HandshakeCodec::serialize_handshake(&theirs()))
            .read(&frame(PeerMessage::KeepAlive))
            .read(&bitfield(&[0b1010_0000]))
            .build();

        let connection =
            PeerConnection::establish(stream, address(), &ours(), 4, &NetworkConfig::default())
                .await
                .unwrap();

        assert_eq!(connection.state(), PeerState::Ready);
        assert!(connection.is_choked());
        assert!(connection.remote_has(PieceIndex::new(0)));
        assert!(!connection.remote_has(PieceIndex::new(1)));
        assert!(connection.remote_has(PieceIndex::new(2)));
        assert_eq!(connection.remote_peer_id(), Some(PeerId::new([9u8; 20])));
    }

    #[tokio::test]
    async fn test_first_message_must_be_bitfield() {
        let stream = Builder::new()
            .write(&HandshakeCodec::serialize_handshake(&ours()))
            .read(&HandshakeCodec::serialize_handshake(&theirs()))
            .read(&frame(PeerMessage::Unchoke))
            .build();

        let result =
            PeerConnection::establish(stream, address(), &ours(), 4, &NetworkConfig::default())
                .await;

        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_bitfield_deadline_is_transport_failure() {
        let stream = Builder::new()
            .write(&HandshakeCodec::serialize_handshake(&ours()))
            .read(&HandshakeCodec::serialize_handshake(&theirs()))
            .wait(Duration::from_millis(200))
            .build();
        let config = NetworkConfig {
            bitfield_timeout: Duration::from_millis(20),
            ..Default::default()
        };

        let result = PeerConnection::establish(stream, address(), &ours(), 4, &config).await;

        let Err(error) = result else {
            panic!("connection should not be ready");
        };
        assert!(matches!(
            error,
            TorrentError::PeerTimeout {
                stage: "bitfield",
                ..
            }
        ));
        assert!(error.is_transport_failure());
    }

    #[tokio::test]
    async fn test_messages_update_choke_and_bitfield() {
        let stream = Builder::new()
            .write(&HandshakeCodec::serialize_handshake(&ours()))
            .read(&HandshakeCodec::serialize_handshake(&theirs()))
            .read(&bitfield(&[0]))
            .write(&frame(PeerMessage::Unchoke))
            .write(&frame(PeerMessage::Interested))
            .read(&frame(PeerMessage::Unchoke))
            .read(&frame(PeerMessage::Have {
                piece_index: PieceIndex::new(3),
            }))
            .read(&frame(PeerMessage::Choke))
            .build();

        let mut connection =
            PeerConnection::establish(stream, address(), &ours(), 4, &NetworkConfig::default())
                .await
                .unwrap();
        connection.send_unchoke().await.unwrap();
        connection.send_interested().await.unwrap();

        assert_eq!(connection.read_message().await.unwrap(), PeerMessage::Unchoke);
        assert!(!connection.is_choked());

        connection.read_message().await.unwrap();
        assert!(connection.remote_has(PieceIndex::new(3)));

        connection.read_message().await.unwrap();
        assert!(connection.is_choked());
    }

    #[tokio::test]
    async fn test_read_failure_closes_connection() {
        let stream = Builder::new()
            .write(&HandshakeCodec::serialize_handshake(&ours()))
            .read(&HandshakeCodec::serialize_handshake(&theirs()))
            .read(&bitfield(&[0xF0]))
            .read(&[0, 0, 0, 9, 7])
            .build();

        let mut connection =
            PeerConnection::establish(stream, address(), &ours(), 4, &NetworkConfig::default())
                .await
                .unwrap();

        let result = connection.read_message().await;
        assert!(matches!(
            result,
            Err(TorrentError::PeerConnectionError { .. })
        ));
        assert_eq!(connection.state(), PeerState::Closed);

        let send = connection.send_have(PieceIndex::new(0)).await;
        assert!(send.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let result = PeerConnection::connect(address, &ours(), 4, &NetworkConfig::default()).await;
        assert!(result.is_err_and(|e| e.is_transport_failure()));
    }
}
