//! HTTP tracker client with announce URL building and response mapping

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;

use super::types::{AnnounceRequest, AnnounceResponse, TrackerClient};
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;
use crate::torrent::parsing::bencode::{self, Value};

/// HTTP tracker client implementation
pub struct HttpTrackerClient {
    announce_url: url::Url,
    client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates an HTTP tracker client using the network timeouts and user agent.
    ///
    /// # Errors
    /// - `TorrentError::UrlParsing` - Announce URL is not a valid URL
    /// - `TorrentError::TrackerConnectionFailed` - Scheme is not HTTP(S)
    /// - `TorrentError::Http` - HTTP client could not be built
    pub fn new(announce_url: &str, config: &NetworkConfig) -> Result<Self, TorrentError> {
        let announce_url = url::Url::parse(announce_url)?;
        if !matches!(announce_url.scheme(), "http" | "https") {
            return Err(TorrentError::TrackerConnectionFailed {
                url: format!("Unsupported tracker scheme: {announce_url}"),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            announce_url,
            client,
        })
    }

    /// Builds the announce URL with query parameters.
    ///
    /// Binary fields are percent-encoded by hand; going through a form
    /// serializer would re-encode them as UTF-8.
    pub(super) fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            urlencoding::encode_binary(request.info_hash.as_bytes()),
            urlencoding::encode_binary(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if let Some(event) = request.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }

        let base = self.announce_url.as_str();
        let separator = if self.announce_url.query().is_some() {
            '&'
        } else {
            '?'
        };
        format!("{base}{separator}{query}")
    }

    /// Parses a compact peer list: 6-byte records of IPv4 address and big-endian port.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Length not a multiple of 6
    pub fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
        if peer_bytes.len() % 6 != 0 {
            return Err(TorrentError::ProtocolError {
                message: format!("Invalid compact peer data length {}", peer_bytes.len()),
            });
        }

        Ok(peer_bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            })
            .collect())
    }

    /// Maps a bencoded announce response onto `AnnounceResponse`.
    ///
    /// # Errors
    /// - `TorrentError::TrackerRejected` - Response carries `failure reason`
    /// - `TorrentError::ProtocolError` - Malformed response
    pub fn parse_announce_response(response_bytes: &[u8]) -> Result<AnnounceResponse, TorrentError> {
        let root = bencode::decode(response_bytes).map_err(|e| TorrentError::ProtocolError {
            message: format!("Failed to parse tracker response: {e}"),
        })?;

        if root.as_dict().is_none() {
            return Err(TorrentError::ProtocolError {
                message: "Tracker response is not a dictionary".to_string(),
            });
        }

        if let Some(reason) = root.get("failure reason") {
            let reason = reason
                .as_bytes()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_else(|| "unspecified".to_string());
            return Err(TorrentError::TrackerRejected { reason });
        }

        let count = |key: &str| {
            root.get(key)
                .and_then(Value::as_integer)
                .and_then(|value| u32::try_from(value).ok())
        };

        let interval = count("interval").ok_or_else(|| TorrentError::ProtocolError {
            message: "Missing interval in tracker response".to_string(),
        })?;

        let peers = match root.get("peers") {
            Some(Value::Bytes(compact)) => Self::parse_compact_peers(compact)?,
            Some(Value::List(entries)) => entries.iter().filter_map(dictionary_peer).collect(),
            Some(_) => {
                return Err(TorrentError::ProtocolError {
                    message: "Unsupported peers encoding in tracker response".to_string(),
                });
            }
            None => Vec::new(),
        };

        Ok(AnnounceResponse {
            interval,
            min_interval: count("min interval"),
            complete: count("complete"),
            incomplete: count("incomplete"),
            peers,
        })
    }

    fn classify_send_error(&self, error: reqwest::Error) -> TorrentError {
        let url = self.announce_url.to_string();
        if error.is_timeout() {
            TorrentError::TrackerTimeout { url }
        } else if error.is_connect() {
            TorrentError::TrackerConnectionFailed { url }
        } else {
            TorrentError::Http(error)
        }
    }
}

/// Non-compact peer entry: `{ "ip": ..., "port": ... }`. Entries whose
/// address is not a literal IP are skipped.
fn dictionary_peer(entry: &Value) -> Option<SocketAddr> {
    let ip = entry.get("ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(entry.get("port")?.as_integer()?).ok()?;
    Some(SocketAddr::new(ip, port))
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(&request);
        tracing::debug!("Announcing to tracker: {}", self.announce_url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            tracing::warn!("HTTP request to {} failed: {}", self.announce_url, e);
            self.classify_send_error(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                "Tracker {} returned error status: {}",
                self.announce_url,
                status
            );
            return Err(TorrentError::TrackerServerError {
                url: self.announce_url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.classify_send_error(e))?;

        let announce = Self::parse_announce_response(&body).inspect_err(|e| {
            tracing::warn!("Failed to parse response from {}: {}", self.announce_url, e);
        })?;

        tracing::debug!(
            "Announced to {}, received {} peers (interval {}s)",
            self.announce_url,
            announce.peers.len(),
            announce.interval
        );
        Ok(announce)
    }

    fn tracker_url(&self) -> &str {
        self.announce_url.as_str()
    }
}
