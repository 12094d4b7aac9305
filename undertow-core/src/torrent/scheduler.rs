//! Per-connection piece download loop

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use super::{
    PeerConnection, PeerMessage, PieceProgress, PieceResult, PieceWork, TorrentError, WorkQueue,
};
use crate::config::UndertowConfig;

/// Why a worker stopped driving its connection.
#[derive(Debug)]
pub enum WorkerExit {
    /// Download finished or was cancelled.
    QueueClosed,
    /// Connection is unusable; the piece in flight went back to the queue.
    ConnectionFailed(TorrentError),
    /// Result consumers are gone.
    ResultChannelClosed,
}

/// Pulls pieces from the shared queue and downloads them from one peer.
///
/// Each worker owns a scheduler and a connection. Pieces the peer lacks or
/// that fail verification go back to the queue; any connection error also
/// returns the piece and ends the worker.
#[derive(Debug, Clone)]
pub struct PieceScheduler {
    queue: Arc<WorkQueue>,
    results: mpsc::Sender<PieceResult>,
    block_size: u32,
    max_backlog: usize,
    piece_timeout: Duration,
    idle_poll: Duration,
}

impl PieceScheduler {
    pub fn new(
        queue: Arc<WorkQueue>,
        results: mpsc::Sender<PieceResult>,
        config: &UndertowConfig,
    ) -> Self {
        Self {
            queue,
            results,
            block_size: config.torrent.block_size,
            max_backlog: config.torrent.max_backlog,
            piece_timeout: config.torrent.piece_timeout,
            idle_poll: config.network.idle_poll,
        }
    }

    /// Runs until the queue closes, the connection fails or results can no
    /// longer be delivered.
    pub async fn run<S>(&self, connection: &mut PeerConnection<S>) -> WorkerExit
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let address = connection.address();
        let mut skipped = 0usize;

        loop {
            let Some(work) = self.queue.pop().await else {
                return WorkerExit::QueueClosed;
            };

            if !connection.remote_has(work.index) {
                self.queue.push(work);
                skipped += 1;

                // Every queued piece was offered once; wait for a `have`.
                if skipped >= self.queue.len() {
                    skipped = 0;
                    if let Err(e) = self.wait_for_peer(connection).await {
                        log_connection_failure(address, &e);
                        return WorkerExit::ConnectionFailed(e);
                    }
                }
                continue;
            }
            skipped = 0;

            let progress = match self.attempt_piece(connection, &work).await {
                Ok(progress) => progress,
                Err(e) => {
                    log_connection_failure(address, &e);
                    self.queue.push(work);
                    return WorkerExit::ConnectionFailed(e);
                }
            };

            if let Err(e) = progress.verify(&work.expected_hash) {
                tracing::warn!("{} from {}, requeueing", e, address);
                self.queue.push(work);
                continue;
            }

            tracing::debug!("Piece {} verified from {}", work.index, address);
            if self.results.send(progress.into_result()).await.is_err() {
                return WorkerExit::ResultChannelClosed;
            }

            if let Err(e) = connection.send_have(work.index).await {
                log_connection_failure(address, &e);
                return WorkerExit::ConnectionFailed(e);
            }
        }
    }

    async fn attempt_piece<S>(
        &self,
        connection: &mut PeerConnection<S>,
        work: &PieceWork,
    ) -> Result<PieceProgress, TorrentError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        tokio::time::timeout(self.piece_timeout, self.download_blocks(connection, work))
            .await
            .map_err(|_| TorrentError::PeerTimeout {
                stage: "piece",
                after: self.piece_timeout,
            })?
    }

    async fn download_blocks<S>(
        &self,
        connection: &mut PeerConnection<S>,
        work: &PieceWork,
    ) -> Result<PieceProgress, TorrentError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut progress = PieceProgress::new(work);

        while !progress.is_complete() {
            if !connection.is_choked() {
                while progress.wants_request(self.max_backlog) {
                    let (offset, length) = progress.next_block(self.block_size);
                    connection.send_request(work.index, offset, length).await?;
                }
            }

            // Choke, unchoke and have are applied inside read_message. A choke
            // mid-piece keeps the backlog counted as outstanding; if the peer
            // drops those requests the attempt ends at piece_timeout.
            let message = connection.read_message().await?;
            if let PeerMessage::Piece { .. } = message {
                progress.record_block(&message)?;
            }
        }

        Ok(progress)
    }

    /// Reads at most one message, giving the peer a chance to announce pieces.
    async fn wait_for_peer<S>(&self, connection: &mut PeerConnection<S>) -> Result<(), TorrentError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match tokio::time::timeout(self.idle_poll, connection.read_message()).await {
            Ok(Ok(_)) | Err(_) => Ok(()),
            Ok(Err(e)) => Err(e),
        }
    }
}

fn log_connection_failure(address: std::net::SocketAddr, error: &TorrentError) {
    if error.is_protocol_violation() {
        tracing::warn!("Protocol violation from {}: {}", address, error);
    } else if error.is_transport_failure() {
        tracing::warn!("Connection to {} lost: {}", address, error);
    } else {
        tracing::warn!("Worker for {} stopped: {}", address, error);
    }
}
