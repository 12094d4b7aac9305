//! HTTP tracker announce and peer list decoding.

pub mod client;
pub mod types;

pub use client::HttpTrackerClient;
pub use types::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};
