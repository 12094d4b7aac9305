//! BitTorrent wire protocol message framing

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::super::{PieceIndex, TorrentError};
use super::types::PeerMessage;

/// Largest frame accepted from a peer, checked before buffering its body.
pub const MAX_FRAME_LENGTH: usize = 2 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Message serialization utilities for BitTorrent wire protocol.
///
/// Frame layout: `length(4, BE) = 1 + payload`, `id(1)`, payload. A frame
/// with length zero carries no id and is a keep-alive.
pub struct MessageCodec;

impl MessageCodec {
    /// Encodes a message as one complete frame.
    pub fn serialize_message(message: &PeerMessage) -> Bytes {
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + Self::body_len(message));
        buf.put_u32(Self::body_len(message) as u32);

        let Some(id) = message.id() else {
            return buf.freeze();
        };
        buf.put_u8(id);

        match message {
            PeerMessage::KeepAlive
            | PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => {}
            PeerMessage::Have { piece_index } => buf.put_u32(piece_index.as_u32()),
            PeerMessage::Bitfield { bitfield } => buf.put_slice(bitfield),
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            }
            | PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            PeerMessage::Unknown { payload, .. } => buf.put_slice(payload),
        }

        buf.freeze()
    }

    /// Decodes exactly one complete frame.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Truncated frame, trailing bytes or malformed payload
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        let mut buf = BytesMut::from(data);
        let message = Self::decode_frame(&mut buf)?.ok_or_else(|| TorrentError::ProtocolError {
            message: "Incomplete message".to_string(),
        })?;

        if !buf.is_empty() {
            return Err(TorrentError::ProtocolError {
                message: format!("{} trailing bytes after message", buf.len()),
            });
        }

        Ok(message)
    }

    /// Removes the first complete frame from `buf` and decodes it.
    ///
    /// Returns `Ok(None)` while the frame is still incomplete, leaving `buf`
    /// untouched so more bytes can be appended.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Declared length above `MAX_FRAME_LENGTH` or malformed payload
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<PeerMessage>, TorrentError> {
        if buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > MAX_FRAME_LENGTH {
            return Err(TorrentError::ProtocolError {
                message: format!("Frame length {length} exceeds limit of {MAX_FRAME_LENGTH}"),
            });
        }

        if buf.len() < LENGTH_PREFIX + length {
            buf.reserve(LENGTH_PREFIX + length - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX);
        let body = buf.split_to(length).freeze();
        Self::decode_body(body).map(Some)
    }

    /// Decodes a frame body (everything after the length prefix).
    fn decode_body(mut body: Bytes) -> Result<PeerMessage, TorrentError> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let id = body.get_u8();
        let message = match id {
            0 => PeerMessage::Choke,
            1 => PeerMessage::Unchoke,
            2 => PeerMessage::Interested,
            3 => PeerMessage::NotInterested,
            4 => {
                expect_payload_len("have", &body, 4)?;
                PeerMessage::Have {
                    piece_index: PieceIndex::new(body.get_u32()),
                }
            }
            5 => PeerMessage::Bitfield { bitfield: body },
            6 | 8 => {
                expect_payload_len(if id == 6 { "request" } else { "cancel" }, &body, 12)?;
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                let length = body.get_u32();
                if id == 6 {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                }
            }
            7 => {
                if body.len() < 8 {
                    return Err(TorrentError::ProtocolError {
                        message: format!("Piece payload too short: {} bytes", body.len()),
                    });
                }
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: body,
                }
            }
            _ => PeerMessage::Unknown { id, payload: body },
        };

        Ok(message)
    }

    fn body_len(message: &PeerMessage) -> usize {
        match message {
            PeerMessage::KeepAlive => 0,
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => 1,
            PeerMessage::Have { .. } => 5,
            PeerMessage::Bitfield { bitfield } => 1 + bitfield.len(),
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => 13,
            PeerMessage::Piece { data, .. } => 9 + data.len(),
            PeerMessage::Unknown { payload, .. } => 1 + payload.len(),
        }
    }
}

fn expect_payload_len(kind: &str, payload: &Bytes, expected: usize) -> Result<(), TorrentError> {
    if payload.len() != expected {
        return Err(TorrentError::ProtocolError {
            message: format!(
                "Invalid {kind} payload length {} (expected {expected})",
                payload.len()
            ),
        });
    }
    Ok(())
}

/// Writes one framed message to the transport.
///
/// # Errors
/// - `TorrentError::PeerConnectionError` - Write failed
pub async fn write_message<W>(writer: &mut W, message: &PeerMessage) -> Result<(), TorrentError>
where
    W: AsyncWrite + Unpin,
{
    let frame = MessageCodec::serialize_message(message);
    writer
        .write_all(&frame)
        .await
        .map_err(|e| TorrentError::PeerConnectionError {
            reason: format!("Failed to send {}: {e}", message.kind()),
        })
}

/// Copies the block carried by a `piece` message into `buffer`.
///
/// Returns the number of bytes copied. The buffer is left untouched when the
/// message is rejected.
///
/// # Errors
/// - `TorrentError::ProtocolError` - Not a piece message, wrong piece index,
///   or block outside the buffer
pub fn copy_piece_data(
    expected_index: PieceIndex,
    buffer: &mut [u8],
    message: &PeerMessage,
) -> Result<usize, TorrentError> {
    let PeerMessage::Piece {
        piece_index,
        offset,
        data,
    } = message
    else {
        return Err(TorrentError::ProtocolError {
            message: format!("Expected piece message, got {}", message.kind()),
        });
    };

    if *piece_index != expected_index {
        return Err(TorrentError::ProtocolError {
            message: format!("Expected piece {expected_index}, got {piece_index}"),
        });
    }

    let begin = *offset as usize;
    if begin >= buffer.len() {
        return Err(TorrentError::ProtocolError {
            message: format!("Block offset {begin} outside piece of {} bytes", buffer.len()),
        });
    }

    let end = begin + data.len();
    if end > buffer.len() {
        return Err(TorrentError::ProtocolError {
            message: format!(
                "Block {begin}..{end} overruns piece of {} bytes",
                buffer.len()
            ),
        });
    }

    buffer[begin..end].copy_from_slice(data);
    Ok(data.len())
}
