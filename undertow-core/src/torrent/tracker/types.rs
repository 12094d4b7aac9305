//! Core types for BitTorrent tracker communication

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::torrent::{InfoHash, PeerId, TorrentError};

/// Tracker announce request.
///
/// Client statistics and torrent identity sent to the tracker in exchange
/// for a peer list.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// Port reported for incoming connections
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes remaining to download
    pub left: u64,
    /// `None` for a regular periodic announce
    pub event: Option<AnnounceEvent>,
}

/// BitTorrent announce events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    /// Value of the `event` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Tracker announce response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds until the next regular announce
    pub interval: u32,
    pub min_interval: Option<u32>,
    /// Seeders in the swarm, when reported
    pub complete: Option<u32>,
    /// Leechers in the swarm, when reported
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

/// Abstract tracker communication interface.
///
/// Implementations handle transport details while keeping error reporting
/// consistent across tracker kinds.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announces client presence to tracker and retrieves peer list.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - Network failure
    /// - `TorrentError::TrackerTimeout` - No response within the configured timeout
    /// - `TorrentError::TrackerServerError` - Non-success HTTP status
    /// - `TorrentError::TrackerRejected` - Tracker returned a failure reason
    /// - `TorrentError::ProtocolError` - Malformed response body
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError>;

    /// Returns tracker URL for debugging and logging purposes.
    fn tracker_url(&self) -> &str;
}
