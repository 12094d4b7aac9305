//! Metainfo parser mapping bencode values onto `TorrentDescriptor`

use std::path::Path;

use async_trait::async_trait;
use sha1::{Digest, Sha1};

use super::super::{InfoHash, TorrentError};
use super::bencode::{self, Value};
use super::types::{TorrentDescriptor, TorrentParser};

/// Parser for single-file .torrent metainfo.
#[derive(Debug, Default)]
pub struct BencodeTorrentParser;

impl BencodeTorrentParser {
    /// Creates new bencode parser instance.
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core of [`TorrentParser::parse_torrent_data`].
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Missing or inconsistent fields
    /// - `TorrentError::Bencode` - Malformed bencode
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentDescriptor, TorrentError> {
        let root = bencode::decode(data)?;
        if root.as_dict().is_none() {
            return Err(invalid("Torrent root is not a dictionary"));
        }

        let raw_info = bencode::raw_dict_value(data, b"info")?
            .ok_or_else(|| invalid("Missing 'info' field"))?;
        let info = root
            .get("info")
            .filter(|info| info.as_dict().is_some())
            .ok_or_else(|| invalid("'info' field is not a dictionary"))?;

        if info.get("files").is_some() {
            return Err(invalid("Multi-file torrents are not supported"));
        }

        let name = info
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("Missing or non-UTF-8 'name' field"))?
            .to_string();

        let piece_length = info
            .get("piece length")
            .and_then(Value::as_integer)
            .and_then(|length| u32::try_from(length).ok())
            .ok_or_else(|| invalid("Missing or out of range 'piece length' field"))?;

        let total_length = info
            .get("length")
            .and_then(Value::as_integer)
            .and_then(|length| u64::try_from(length).ok())
            .ok_or_else(|| invalid("Missing or negative 'length' field"))?;

        let pieces = info
            .get("pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| invalid("Missing 'pieces' field"))?;
        if pieces.len() % 20 != 0 {
            return Err(invalid(&format!(
                "Invalid pieces length {} (not a multiple of 20)",
                pieces.len()
            )));
        }
        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let descriptor = TorrentDescriptor {
            info_hash: InfoHash::new(Sha1::digest(raw_info).into()),
            name,
            piece_length,
            total_length,
            piece_hashes,
            announce_urls: announce_urls(&root),
        };
        descriptor.validate()?;

        tracing::debug!(
            "Parsed torrent {} ({} bytes, {} pieces, info hash {})",
            descriptor.name,
            descriptor.total_length,
            descriptor.piece_count(),
            descriptor.info_hash
        );
        Ok(descriptor)
    }
}

#[async_trait]
impl TorrentParser for BencodeTorrentParser {
    async fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentDescriptor, TorrentError> {
        Self::parse_bytes(data)
    }

    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentDescriptor, TorrentError> {
        let contents = tokio::fs::read(path).await?;
        self.parse_torrent_data(&contents).await
    }
}

/// `announce` followed by every tier of `announce-list`, without duplicates.
fn announce_urls(root: &Value) -> Vec<String> {
    let primary = root.get("announce").and_then(Value::as_str);
    let tiers = root
        .get("announce-list")
        .and_then(Value::as_list)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_list)
        .flatten()
        .filter_map(Value::as_str);

    let mut urls: Vec<String> = Vec::new();
    for url in primary.into_iter().chain(tiers) {
        if !url.is_empty() && !urls.iter().any(|known| known == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

fn invalid(reason: &str) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.to_string(),
    }
}
