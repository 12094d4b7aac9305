//! CLI command implementations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Subcommand;
use tokio::fs;
use undertow_core::config::UndertowConfig;
use undertow_core::torrent::{
    BencodeTorrentParser, DownloadCoordinator, PeerSource, StaticPeerSource, TorrentDescriptor,
    TrackerPeerSource, Value, parsing::bencode,
};
use undertow_core::{TorrentError, UndertowError};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download a single-file torrent
    Download {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Where to write the file (defaults to the torrent's name)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Give up after this many seconds
        #[arg(short, long)]
        deadline: Option<u64>,
        /// Peer to download from instead of asking trackers (repeatable)
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,
        /// Number of result consumer tasks
        #[arg(long)]
        consumers: Option<usize>,
    },
    /// Show the metadata of a .torrent file
    Inspect {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pretty-print any bencoded file
    Dump {
        /// Path to a bencoded file
        file: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the failure of whichever command ran, with a user-facing message
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Download {
            torrent,
            output,
            deadline,
            peers,
            consumers,
        } => download(torrent, output, deadline, peers, consumers).await,
        Commands::Inspect { torrent, json } => inspect(&torrent, json).await,
        Commands::Dump { file } => dump(&file).await,
    }
}

/// Download a torrent and write the assembled file
///
/// # Errors
/// - Torrent file unreadable or invalid
/// - No way to find peers
/// - Download timed out or ran out of peers
/// - Output file could not be written
pub async fn download(
    torrent: PathBuf,
    output: Option<PathBuf>,
    deadline: Option<u64>,
    peers: Vec<SocketAddr>,
    consumers: Option<usize>,
) -> anyhow::Result<()> {
    let descriptor = Arc::new(load_descriptor(&torrent).await?);

    let mut config = UndertowConfig::from_env();
    if let Some(seconds) = deadline {
        config.download.deadline = Some(Duration::from_secs(seconds));
    }
    if let Some(count) = consumers {
        if count == 0 {
            bail!("--consumers must be at least 1");
        }
        config.download.result_consumers = count;
    }

    let coordinator = DownloadCoordinator::new(config);
    let source = peer_source(&descriptor, &coordinator, peers)?;
    let output = output.unwrap_or_else(|| PathBuf::from(&descriptor.name));

    println!(
        "Downloading {} ({} pieces, {})",
        descriptor.name,
        descriptor.piece_count(),
        format_bytes(descriptor.total_length)
    );

    let completed = coordinator
        .download(Arc::clone(&descriptor), source)
        .await
        .map_err(user_error)?;

    fs::write(&output, &completed.data)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    let report = completed.report;
    println!(
        "Saved {} to {} in {:.1?} using {} peers",
        format_bytes(report.total_bytes),
        output.display(),
        report.elapsed,
        report.peers_contacted
    );
    Ok(())
}

/// Print the descriptor of a torrent file
///
/// # Errors
/// - Torrent file unreadable or invalid
pub async fn inspect(torrent: &Path, json: bool) -> anyhow::Result<()> {
    let descriptor = load_descriptor(torrent).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&descriptor)?);
    } else {
        print!("{}", describe(&descriptor));
    }
    Ok(())
}

/// Print a bencoded file as an indented tree
///
/// # Errors
/// - File unreadable or not valid bencode
pub async fn dump(file: &Path) -> anyhow::Result<()> {
    let data = fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let value: Value = bencode::decode(&data)
        .with_context(|| format!("{} is not valid bencode", file.display()))?;
    print!("{value}");
    Ok(())
}

async fn load_descriptor(path: &Path) -> anyhow::Result<TorrentDescriptor> {
    let data = fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    BencodeTorrentParser::parse_bytes(&data).map_err(user_error)
}

fn peer_source(
    descriptor: &TorrentDescriptor,
    coordinator: &DownloadCoordinator,
    peers: Vec<SocketAddr>,
) -> anyhow::Result<Arc<dyn PeerSource>> {
    if !peers.is_empty() {
        tracing::info!("Using {} peers from the command line", peers.len());
        return Ok(Arc::new(StaticPeerSource::new(peers)));
    }
    if descriptor.announce_urls.is_empty() {
        bail!("Torrent lists no trackers; pass at least one --peer address");
    }

    let source = TrackerPeerSource::new(descriptor, coordinator.peer_id(), coordinator.config())
        .map_err(user_error)?;
    tracing::info!("Discovering peers through {} trackers", descriptor.announce_urls.len());
    Ok(Arc::new(source))
}

fn user_error(error: TorrentError) -> anyhow::Error {
    let detail = error.to_string();
    let error = UndertowError::from(error);
    anyhow::anyhow!("{} ({detail})", error.user_message())
}

fn describe(descriptor: &TorrentDescriptor) -> String {
    let mut text = String::new();
    text.push_str(&format!("Name:         {}\n", descriptor.name));
    text.push_str(&format!("Info hash:    {}\n", descriptor.info_hash));
    text.push_str(&format!(
        "Size:         {} ({} bytes)\n",
        format_bytes(descriptor.total_length),
        descriptor.total_length
    ));
    text.push_str(&format!(
        "Pieces:       {} x {}\n",
        descriptor.piece_count(),
        format_bytes(descriptor.piece_length as u64)
    ));
    if descriptor.announce_urls.is_empty() {
        text.push_str("Trackers:     none\n");
    } else {
        text.push_str("Trackers:\n");
        for url in &descriptor.announce_urls {
            text.push_str(&format!("  {url}\n"));
        }
    }
    text
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use undertow_core::torrent::InfoHash;

    use super::*;

    fn descriptor(announce_urls: Vec<String>) -> TorrentDescriptor {
        TorrentDescriptor {
            info_hash: InfoHash::new([0xAB; 20]),
            name: "debian.iso".to_string(),
            piece_length: 262144,
            total_length: 300000,
            piece_hashes: vec![[0u8; 20]; 2],
            announce_urls,
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(262144), "256.00 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }

    #[test]
    fn test_describe_lists_trackers() {
        let text = describe(&descriptor(vec!["http://t/announce".to_string()]));
        assert!(text.contains("Name:         debian.iso"));
        assert!(text.contains(&"ab".repeat(20)));
        assert!(text.contains("Pieces:       2 x 256.00 KiB"));
        assert!(text.contains("  http://t/announce"));
    }

    #[test]
    fn test_trackerless_torrent_needs_peers() {
        let coordinator = DownloadCoordinator::new(UndertowConfig::default());
        let trackerless = descriptor(Vec::new());

        assert!(peer_source(&trackerless, &coordinator, Vec::new()).is_err());
        assert!(peer_source(&trackerless, &coordinator, vec!["127.0.0.1:6881".parse().unwrap()]).is_ok());
    }

    #[tokio::test]
    async fn test_inspect_rejects_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.torrent");
        fs::write(&path, b"not bencode").await.unwrap();

        let error = inspect(&path, false).await.unwrap_err();
        assert!(error.to_string().starts_with("Invalid torrent file"));
    }
}
