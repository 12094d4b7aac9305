//! Test data creation for torrent testing.
//!
//! Provides deterministic torrents and a scriptable seeding peer on a loopback
//! listener so scheduler and coordinator tests run over real sockets.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::protocol::{HANDSHAKE_LEN, HandshakeCodec, MessageCodec};
use super::{
    Bitfield, InfoHash, PeerHandshake, PeerId, PeerMessage, PieceIndex, TorrentDescriptor, Value,
};

/// How long the seeder waits for more requests before answering a batch.
const QUIET_PERIOD: Duration = Duration::from_millis(30);

/// Torrent whose content and metainfo are generated from its dimensions.
#[derive(Debug, Clone)]
pub struct TestTorrent {
    pub descriptor: TorrentDescriptor,
    pub content: Bytes,
}

impl TestTorrent {
    /// Builds a torrent with patterned content and no trackers.
    pub fn new(piece_length: u32, total_length: u64) -> Self {
        Self::with_announce(piece_length, total_length, None)
    }

    /// Builds a torrent announcing to `announce`.
    pub fn with_announce(piece_length: u32, total_length: u64, announce: Option<&str>) -> Self {
        let content: Bytes = (0..total_length)
            .map(|i| (i.wrapping_mul(31) ^ (i >> 9)) as u8)
            .collect::<Vec<u8>>()
            .into();

        let piece_hashes: Vec<[u8; 20]> = content
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();

        let name = "test.bin".to_string();
        let info = info_value(&name, piece_length, total_length, &piece_hashes);
        let info_hash = InfoHash::new(Sha1::digest(info.encode()).into());

        Self {
            descriptor: TorrentDescriptor {
                info_hash,
                name,
                piece_length,
                total_length,
                piece_hashes,
                announce_urls: announce.map(str::to_string).into_iter().collect(),
            },
            content,
        }
    }

    /// Expected bytes of one piece.
    pub fn piece_data(&self, index: PieceIndex) -> Bytes {
        let (begin, end) = self.descriptor.piece_bounds(index);
        self.content.slice(begin as usize..end as usize)
    }

    /// Bencoded metainfo for this torrent, as a `.torrent` file would hold it.
    pub fn metainfo(&self) -> Bytes {
        let descriptor = &self.descriptor;
        let mut root = BTreeMap::new();
        if let Some(announce) = descriptor.announce_urls.first() {
            root.insert(Bytes::from_static(b"announce"), Value::from(announce.as_str()));
        }
        root.insert(
            Bytes::from_static(b"info"),
            info_value(
                &descriptor.name,
                descriptor.piece_length,
                descriptor.total_length,
                &descriptor.piece_hashes,
            ),
        );
        Value::Dict(root).encode()
    }
}

fn info_value(name: &str, piece_length: u32, total_length: u64, hashes: &[[u8; 20]]) -> Value {
    let mut info = BTreeMap::new();
    info.insert(Bytes::from_static(b"length"), Value::from(total_length as i64));
    info.insert(Bytes::from_static(b"name"), Value::from(name));
    info.insert(Bytes::from_static(b"piece length"), Value::from(piece_length as i64));
    info.insert(Bytes::from_static(b"pieces"), Value::Bytes(Bytes::from(hashes.concat())));
    Value::Dict(info)
}

/// Scripted deviations from a well-behaved seeder.
#[derive(Debug, Clone, Default)]
pub struct SeederBehavior {
    /// Pieces advertised in the bitfield; all when `None`.
    pub pieces: Option<Vec<u32>>,
    /// Stay choked this long after the bitfield; unchoke immediately when `None`.
    pub unchoke_after: Option<Duration>,
    /// Send `have` for every unadvertised piece after this delay.
    pub announce_rest_after: Option<Duration>,
    /// Number of blocks answered with the wrong piece index.
    pub wrong_index_blocks: usize,
    /// Number of blocks answered with a flipped byte.
    pub corrupt_blocks: usize,
    /// Accept requests but never answer them.
    pub ignore_requests: bool,
    /// Answer the handshake with a different info hash.
    pub wrong_info_hash: bool,
}

/// Observations shared across every connection to one seeder.
#[derive(Debug, Default)]
pub struct SeederStats {
    connections: AtomicUsize,
    requests: AtomicUsize,
    requests_while_choked: AtomicUsize,
    max_outstanding: AtomicUsize,
    max_request_length: AtomicU32,
    haves: Mutex<Vec<u32>>,
}

impl SeederStats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn requests_while_choked(&self) -> usize {
        self.requests_while_choked.load(Ordering::SeqCst)
    }

    /// Largest number of unanswered requests seen on one connection.
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    pub fn max_request_length(&self) -> u32 {
        self.max_request_length.load(Ordering::SeqCst)
    }

    /// Piece indices the client announced with `have`.
    pub fn haves_received(&self) -> Vec<u32> {
        self.haves.lock().clone()
    }
}

struct SeederShared {
    torrent: TestTorrent,
    behavior: SeederBehavior,
    wrong_index_left: AtomicUsize,
    corrupt_left: AtomicUsize,
    stats: Arc<SeederStats>,
}

/// Seeding peer listening on an ephemeral loopback port.
///
/// Requests are answered in batches once the client goes quiet, so the
/// number of requests a client pipelines is observable in `SeederStats`.
pub struct MockSeeder {
    address: SocketAddr,
    stats: Arc<SeederStats>,
    task: JoinHandle<()>,
}

impl MockSeeder {
    pub async fn spawn(torrent: &TestTorrent, behavior: SeederBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock seeder");
        let address = listener.local_addr().expect("mock seeder address");
        let stats = Arc::new(SeederStats::default());

        let shared = Arc::new(SeederShared {
            torrent: torrent.clone(),
            wrong_index_left: AtomicUsize::new(behavior.wrong_index_blocks),
            corrupt_left: AtomicUsize::new(behavior.corrupt_blocks),
            behavior,
            stats: Arc::clone(&stats),
        });

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, shared).await {
                        tracing::trace!("Mock seeder connection ended: {}", e);
                    }
                });
            }
        });

        Self {
            address,
            stats,
            task,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stats(&self) -> &SeederStats {
        &self.stats
    }
}

impl Drop for MockSeeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Address with nothing listening behind it.
pub async fn unreachable_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    listener.local_addr().expect("probe address")
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn invalid_data(error: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error.to_string())
}

async fn send(stream: &mut TcpStream, message: &PeerMessage) -> io::Result<()> {
    stream
        .write_all(&MessageCodec::serialize_message(message))
        .await
}

async fn serve(mut stream: TcpStream, shared: Arc<SeederShared>) -> io::Result<()> {
    let stats = &shared.stats;
    let behavior = &shared.behavior;
    let descriptor = &shared.torrent.descriptor;
    let piece_count = descriptor.piece_count();
    stats.connections.fetch_add(1, Ordering::SeqCst);

    let mut handshake = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut handshake).await?;
    let theirs = HandshakeCodec::deserialize_handshake(&handshake).map_err(invalid_data)?;
    let info_hash = if behavior.wrong_info_hash {
        InfoHash::new([0xAB; 20])
    } else {
        theirs.info_hash
    };
    let ours = PeerHandshake::new(info_hash, PeerId::generate_with_prefix("-MOCK01-"));
    stream
        .write_all(&HandshakeCodec::serialize_handshake(&ours))
        .await?;

    let mut bitfield = match &behavior.pieces {
        Some(pieces) => {
            let mut bitfield = Bitfield::new(piece_count);
            for &index in pieces {
                bitfield.set_piece(PieceIndex::new(index));
            }
            bitfield
        }
        None => Bitfield::full(piece_count),
    };
    let payload = Bytes::copy_from_slice(bitfield.as_bytes());
    send(&mut stream, &PeerMessage::Bitfield { bitfield: payload }).await?;

    let started = Instant::now();
    let mut choked = true;
    if behavior.unchoke_after.is_none() {
        send(&mut stream, &PeerMessage::Unchoke).await?;
        choked = false;
    }

    let mut announced = false;
    let mut buffer = BytesMut::with_capacity(4096);
    let mut pending: Vec<(PieceIndex, u32, u32)> = Vec::new();

    loop {
        if choked
            && let Some(delay) = behavior.unchoke_after
            && started.elapsed() >= delay
        {
            send(&mut stream, &PeerMessage::Unchoke).await?;
            choked = false;
        }

        if !announced
            && let Some(delay) = behavior.announce_rest_after
            && started.elapsed() >= delay
        {
            for index in 0..piece_count as u32 {
                let piece_index = PieceIndex::new(index);
                if !bitfield.has_piece(piece_index) {
                    bitfield.set_piece(piece_index);
                    send(&mut stream, &PeerMessage::Have { piece_index }).await?;
                }
            }
            announced = true;
        }

        while let Some(message) = MessageCodec::decode_frame(&mut buffer).map_err(invalid_data)? {
            match message {
                PeerMessage::Request {
                    piece_index,
                    offset,
                    length,
                } => {
                    stats.requests.fetch_add(1, Ordering::SeqCst);
                    stats.max_request_length.fetch_max(length, Ordering::SeqCst);
                    if choked {
                        stats.requests_while_choked.fetch_add(1, Ordering::SeqCst);
                    } else if !behavior.ignore_requests {
                        pending.push((piece_index, offset, length));
                        stats
                            .max_outstanding
                            .fetch_max(pending.len(), Ordering::SeqCst);
                    }
                }
                PeerMessage::Have { piece_index } => {
                    stats.haves.lock().push(piece_index.as_u32());
                }
                _ => {}
            }
        }

        match tokio::time::timeout(QUIET_PERIOD, stream.read_buf(&mut buffer)).await {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                for (piece_index, offset, length) in pending.drain(..) {
                    let piece = shared.torrent.piece_data(piece_index);
                    let end = offset as usize + length as usize;
                    if !bitfield.has_piece(piece_index) || end > piece.len() {
                        continue;
                    }

                    let mut block = piece[offset as usize..end].to_vec();
                    let mut sent_index = piece_index;
                    if take_one(&shared.wrong_index_left) {
                        sent_index = PieceIndex::new((piece_index.as_u32() + 1) % piece_count as u32);
                    } else if take_one(&shared.corrupt_left)
                        && let Some(byte) = block.first_mut()
                    {
                        *byte ^= 0xFF;
                    }

                    let message = PeerMessage::Piece {
                        piece_index: sent_index,
                        offset,
                        data: Bytes::from(block),
                    };
                    send(&mut stream, &message).await?;
                }
            }
        }
    }
}
