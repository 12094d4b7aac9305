//! Centralized configuration for Undertow.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all Undertow components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub download: DownloadConfig,
}

/// BitTorrent protocol-specific configuration.
///
/// Controls request pipelining and per-piece deadlines.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Peer id prefix identifying this client
    pub client_prefix: &'static str,
    /// Largest block requested in a single `request` message
    pub block_size: u32,
    /// Maximum unanswered requests per connection
    pub max_backlog: usize,
    /// Deadline for downloading one piece from one peer
    pub piece_timeout: Duration,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_prefix: "-UT0001-",
            block_size: 16384, // 16 KiB
            max_backlog: 5,
            piece_timeout: Duration::from_secs(30),
        }
    }
}

/// Network communication and tracker configuration.
///
/// Controls peer connection stage deadlines, tracker HTTP behaviour and
/// how often the peer set is refreshed.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP connect deadline
    pub connect_timeout: Duration,
    /// Handshake exchange deadline
    pub handshake_timeout: Duration,
    /// Deadline for the mandatory bitfield after the handshake
    pub bitfield_timeout: Duration,
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Port reported to trackers
    pub listen_port: u16,
    /// How often peer discovery is re-run
    pub peer_refresh_interval: Duration,
    /// How long an idle worker waits for a peer message before rescanning the queue
    pub idle_poll: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(3),
            bitfield_timeout: Duration::from_secs(5),
            tracker_timeout: Duration::from_secs(15),
            user_agent: "undertow/0.1.0",
            listen_port: 13372,
            peer_refresh_interval: Duration::from_secs(15),
            idle_poll: Duration::from_secs(2),
        }
    }
}

/// Download-wide settings.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Size of the result consumer pool
    pub result_consumers: usize,
    /// Overall deadline (None = unbounded)
    pub deadline: Option<Duration>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            result_consumers: 16,
            deadline: None,
        }
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(seconds) = env_parse::<u64>("UNDERTOW_PIECE_TIMEOUT") {
            config.torrent.piece_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("UNDERTOW_TRACKER_TIMEOUT") {
            config.network.tracker_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("UNDERTOW_REFRESH_INTERVAL")
            && seconds > 0
        {
            config.network.peer_refresh_interval = Duration::from_secs(seconds);
        }

        if let Some(port) = env_parse::<u16>("UNDERTOW_LISTEN_PORT") {
            config.network.listen_port = port;
        }

        if let Some(count) = env_parse::<usize>("UNDERTOW_RESULT_CONSUMERS")
            && count > 0
        {
            config.download.result_consumers = count;
        }

        config
    }

    /// Creates a configuration with short deadlines for loopback tests.
    pub fn for_testing() -> Self {
        Self {
            torrent: TorrentConfig {
                piece_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            network: NetworkConfig {
                connect_timeout: Duration::from_secs(1),
                handshake_timeout: Duration::from_secs(1),
                bitfield_timeout: Duration::from_secs(1),
                tracker_timeout: Duration::from_secs(2),
                peer_refresh_interval: Duration::from_millis(200),
                idle_poll: Duration::from_millis(50),
                ..Default::default()
            },
            download: DownloadConfig {
                result_consumers: 4,
                deadline: Some(Duration::from_secs(20)),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}
