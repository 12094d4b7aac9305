//! BitTorrent peer wire protocol.
//!
//! Handshake, message framing and the per-connection state machine used by
//! the piece scheduler.

pub mod connection;
pub mod handshake;
pub mod messages;
pub mod types;

pub use connection::PeerConnection;
pub use handshake::{HANDSHAKE_LEN, HandshakeCodec, exchange_handshake};
pub use messages::{MAX_FRAME_LENGTH, MessageCodec, copy_piece_data, write_message};
pub use types::{PROTOCOL_STRING, PeerHandshake, PeerId, PeerMessage, PeerState};
