//! Undertow Core - BitTorrent download engine
//!
//! This crate provides the building blocks for downloading a single-file
//! torrent from a swarm: the peer wire protocol, the concurrent piece
//! scheduler, the download coordinator, and the bencode / tracker
//! collaborators that feed them.

pub mod config;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::UndertowConfig;
pub use torrent::{
    CompletedDownload, DownloadCoordinator, DownloadReport, TorrentDescriptor, TorrentError,
};

/// Top-level errors surfaced to Undertow front-ends.
///
/// Wraps subsystem failures so callers can report them uniformly.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::Bencode(e) => format!("Invalid torrent file: {e}"),
                TorrentError::TrackerConnectionFailed { url } => {
                    format!("Could not connect to tracker: {url}")
                }
                TorrentError::TrackerRejected { reason } => {
                    format!("Tracker rejected the announce: {reason}")
                }
                TorrentError::DownloadTimeout { completed, total } => {
                    format!("Download timed out with {completed}/{total} pieces complete")
                }
                TorrentError::PeersExhausted { completed, total } => {
                    format!("Ran out of usable peers with {completed}/{total} pieces complete")
                }
                _ => "Download error occurred".to_string(),
            },
            UndertowError::Configuration { reason } => format!("Configuration error: {reason}"),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Configuration { .. }
                | UndertowError::Torrent(
                    TorrentError::InvalidTorrentFile { .. } | TorrentError::Bencode(_)
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;
