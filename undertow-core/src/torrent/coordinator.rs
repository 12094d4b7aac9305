//! Download coordinator: peer discovery, worker lifecycle and result assembly
//!
//! One worker task per peer address drives a `PieceScheduler` over its own
//! connection. Verified pieces flow through a bounded channel to a pool of
//! result consumers that write them into the `OutputBuffer`. The coordinator
//! task owns the set of contacted addresses, refreshes peers periodically and
//! decides when the download is finished, timed out or starved.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{
    AnnounceEvent, AnnounceRequest, HttpTrackerClient, OutputBuffer, PeerConnection,
    PeerHandshake, PeerId, PieceResult, PieceScheduler, PieceWork, TorrentDescriptor,
    TorrentError, TrackerClient, WorkQueue, WorkerExit,
};
use crate::config::UndertowConfig;

/// Consecutive failed discovery rounds tolerated while no worker is alive.
const MAX_FAILED_DISCOVERIES: u32 = 3;

/// Supplies candidate peer addresses; called once up front and on every refresh.
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Returns the currently known peers. Duplicates are filtered by the caller.
    ///
    /// # Errors
    /// Any `TorrentError`; the coordinator logs it and skips the round.
    async fn discover(&self) -> Result<Vec<SocketAddr>, TorrentError>;
}

/// Fixed peer list, e.g. from the command line.
#[derive(Debug, Clone)]
pub struct StaticPeerSource {
    peers: Vec<SocketAddr>,
}

impl StaticPeerSource {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl PeerSource for StaticPeerSource {
    async fn discover(&self) -> Result<Vec<SocketAddr>, TorrentError> {
        Ok(self.peers.clone())
    }
}

/// Announces to every tracker of a torrent and merges their peer lists.
///
/// The first round carries `event=started`; later rounds are regular
/// announces. A round fails only when every tracker fails.
pub struct TrackerPeerSource {
    trackers: Vec<Box<dyn TrackerClient>>,
    template: AnnounceRequest,
    started: AtomicBool,
}

impl TrackerPeerSource {
    /// Builds HTTP tracker clients for every announce URL of `descriptor`.
    ///
    /// Unusable URLs are skipped with a warning.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - No usable tracker URL
    pub fn new(
        descriptor: &TorrentDescriptor,
        peer_id: PeerId,
        config: &UndertowConfig,
    ) -> Result<Self, TorrentError> {
        let trackers: Vec<Box<dyn TrackerClient>> = descriptor
            .announce_urls
            .iter()
            .filter_map(|url| match HttpTrackerClient::new(url, &config.network) {
                Ok(client) => Some(Box::new(client) as Box<dyn TrackerClient>),
                Err(e) => {
                    warn!("Skipping tracker {}: {}", url, e);
                    None
                }
            })
            .collect();

        if trackers.is_empty() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Torrent has no usable HTTP tracker".to_string(),
            });
        }

        Ok(Self::with_clients(
            trackers,
            descriptor,
            peer_id,
            config.network.listen_port,
        ))
    }

    /// Uses the given tracker clients instead of building HTTP ones.
    pub fn with_clients(
        trackers: Vec<Box<dyn TrackerClient>>,
        descriptor: &TorrentDescriptor,
        peer_id: PeerId,
        port: u16,
    ) -> Self {
        Self {
            trackers,
            template: AnnounceRequest {
                info_hash: descriptor.info_hash,
                peer_id,
                port,
                uploaded: 0,
                downloaded: 0,
                left: descriptor.total_length,
                event: None,
            },
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PeerSource for TrackerPeerSource {
    async fn discover(&self) -> Result<Vec<SocketAddr>, TorrentError> {
        let mut request = self.template.clone();
        if !self.started.swap(true, Ordering::SeqCst) {
            request.event = Some(AnnounceEvent::Started);
        }

        let mut announces: FuturesUnordered<_> = self
            .trackers
            .iter()
            .map(|tracker| {
                let request = request.clone();
                async move { (tracker.tracker_url(), tracker.announce(request).await) }
            })
            .collect();

        let mut peers = Vec::new();
        let mut seen = HashSet::new();
        let mut last_error = None;
        let mut answered = false;

        while let Some((url, outcome)) = announces.next().await {
            match outcome {
                Ok(response) => {
                    answered = true;
                    debug!(
                        "Tracker {} returned {} peers (interval {}s)",
                        url,
                        response.peers.len(),
                        response.interval
                    );
                    peers.extend(response.peers.into_iter().filter(|p| seen.insert(*p)));
                }
                Err(e) => {
                    warn!("Announce to {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(peers),
        }
    }
}

/// Summary of a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub piece_count: usize,
    pub total_bytes: u64,
    pub peers_contacted: usize,
    pub elapsed: Duration,
}

/// Complete file contents plus download statistics.
#[derive(Debug, Clone)]
pub struct CompletedDownload {
    pub data: Bytes,
    pub report: DownloadReport,
}

/// Counters shared between the coordinator, workers and consumers.
#[derive(Debug)]
struct DownloadProgress {
    total: usize,
    completed: AtomicUsize,
    active_workers: AtomicUsize,
    done: Notify,
}

impl DownloadProgress {
    fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn is_complete(&self) -> bool {
        self.completed() >= self.total
    }
}

/// Keeps `active_workers` accurate however a worker task ends.
struct ActiveWorker {
    progress: Arc<DownloadProgress>,
}

impl ActiveWorker {
    fn enter(progress: &Arc<DownloadProgress>) -> Self {
        progress.active_workers.fetch_add(1, Ordering::SeqCst);
        Self {
            progress: Arc::clone(progress),
        }
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.progress.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Downloads one torrent from a swarm into memory.
pub struct DownloadCoordinator {
    config: UndertowConfig,
    peer_id: PeerId,
}

impl DownloadCoordinator {
    /// Creates a coordinator with a fresh peer id.
    pub fn new(config: UndertowConfig) -> Self {
        let peer_id = PeerId::generate_with_prefix(config.torrent.client_prefix);
        Self { config, peer_id }
    }

    /// Peer id used in handshakes and announces.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn config(&self) -> &UndertowConfig {
        &self.config
    }

    /// Downloads every piece of `descriptor` from peers found through `peers`.
    ///
    /// Returns once all pieces are verified and assembled. All worker and
    /// consumer tasks are stopped before returning, whatever the outcome.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Inconsistent descriptor
    /// - `TorrentError::DownloadTimeout` - Configured deadline elapsed
    /// - `TorrentError::PeersExhausted` - No live workers and discovery has nothing new
    pub async fn download(
        &self,
        descriptor: Arc<TorrentDescriptor>,
        peers: Arc<dyn PeerSource>,
    ) -> Result<CompletedDownload, TorrentError> {
        descriptor.validate()?;
        let started = Instant::now();
        let deadline = self
            .config
            .download
            .deadline
            .map(|limit| tokio::time::Instant::now() + limit);
        let total = descriptor.piece_count();

        info!(
            "Starting download of {} ({} pieces, {} bytes, info hash {})",
            descriptor.name, total, descriptor.total_length, descriptor.info_hash
        );

        let queue = Arc::new(WorkQueue::new(PieceWork::all_pieces(&descriptor)));
        let output = Arc::new(OutputBuffer::new(&descriptor));
        let progress = Arc::new(DownloadProgress {
            total,
            completed: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
            done: Notify::new(),
        });

        let (result_sender, result_receiver) = mpsc::channel(total);
        let result_receiver = Arc::new(Mutex::new(result_receiver));
        let mut consumers = JoinSet::new();
        for _ in 0..self.config.download.result_consumers.max(1) {
            consumers.spawn(consume_results(
                Arc::clone(&result_receiver),
                Arc::clone(&output),
                Arc::clone(&progress),
            ));
        }

        let mut swarm = Swarm {
            contacted: HashSet::new(),
            workers: JoinSet::new(),
            scheduler: PieceScheduler::new(Arc::clone(&queue), result_sender, &self.config),
            handshake: PeerHandshake::new(descriptor.info_hash, self.peer_id),
            piece_count: total,
            config: self.config.clone(),
            progress: Arc::clone(&progress),
        };

        let outcome = self
            .drive(&mut swarm, &queue, &progress, peers, deadline, total)
            .await;

        queue.close();
        swarm.workers.shutdown().await;
        consumers.shutdown().await;

        outcome?;

        let report = DownloadReport {
            piece_count: total,
            total_bytes: descriptor.total_length,
            peers_contacted: swarm.contacted.len(),
            elapsed: started.elapsed(),
        };
        info!(
            "Downloaded {} in {:.2?} from {} peers",
            descriptor.name, report.elapsed, report.peers_contacted
        );

        Ok(CompletedDownload {
            data: output.assemble(),
            report,
        })
    }

    async fn drive(
        &self,
        swarm: &mut Swarm,
        queue: &WorkQueue,
        progress: &DownloadProgress,
        peers: Arc<dyn PeerSource>,
        deadline: Option<tokio::time::Instant>,
        total: usize,
    ) -> Result<(), TorrentError> {
        let mut discovery = JoinSet::new();
        let mut starvation = Starvation::default();
        let mut initial_round = true;

        // The first round races the deadline like every later one.
        let initial = Arc::clone(&peers);
        discovery.spawn(async move { initial.discover().await });

        let deadline = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let period = self.config.network.peer_refresh_interval;
        let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            if progress.is_complete() {
                break Ok(());
            }

            tokio::select! {
                _ = progress.done.notified() => {}

                _ = &mut deadline => {
                    warn!("Download deadline reached");
                    break Err(TorrentError::DownloadTimeout {
                        completed: progress.completed(),
                        total,
                    });
                }

                _ = refresh.tick() => {
                    if discovery.is_empty() {
                        let peers = Arc::clone(&peers);
                        discovery.spawn(async move { peers.discover().await });
                    }
                }

                Some(joined) = discovery.join_next() => {
                    let initial = std::mem::replace(&mut initial_round, false);
                    match joined {
                        Ok(Ok(addresses)) => {
                            let launched = swarm.launch(addresses);
                            if initial {
                                info!("Initial discovery found {} peers", launched);
                            } else {
                                debug!("Peer refresh launched {} new workers", launched);
                            }
                            starvation.record_round(launched);
                        }
                        Ok(Err(e)) => {
                            warn!("Peer discovery failed: {}", e);
                            starvation.record_failure();
                        }
                        Err(e) => {
                            warn!("Peer discovery task failed: {}", e);
                            starvation.record_failure();
                        }
                    }
                }

                Some(joined) = swarm.workers.join_next() => {
                    match joined {
                        Ok((address, exit)) => debug!("Worker for {} exited: {:?}", address, exit),
                        Err(e) => warn!("Worker task failed: {}", e),
                    }
                }
            }

            if swarm.workers.is_empty()
                && discovery.is_empty()
                && !queue.is_empty()
                && !progress.is_complete()
                && starvation.is_starved()
            {
                warn!("No peers left to download from");
                break Err(TorrentError::PeersExhausted {
                    completed: progress.completed(),
                    total,
                });
            }
        };

        discovery.shutdown().await;
        result
    }
}

/// Worker tasks plus the addresses already handed to one.
struct Swarm {
    contacted: HashSet<SocketAddr>,
    workers: JoinSet<(SocketAddr, WorkerExit)>,
    scheduler: PieceScheduler,
    handshake: PeerHandshake,
    piece_count: usize,
    config: UndertowConfig,
    progress: Arc<DownloadProgress>,
}

impl Swarm {
    /// Spawns a worker for every address not contacted before.
    fn launch(&mut self, addresses: Vec<SocketAddr>) -> usize {
        let mut launched = 0;
        for address in addresses {
            if !self.contacted.insert(address) {
                continue;
            }
            self.workers.spawn(run_worker(
                address,
                self.handshake.clone(),
                self.piece_count,
                self.config.clone(),
                self.scheduler.clone(),
                ActiveWorker::enter(&self.progress),
            ));
            launched += 1;
        }
        launched
    }
}

/// Outcome of recent discovery rounds, for detecting a dead swarm.
#[derive(Debug, Default)]
struct Starvation {
    last_round_found_new: Option<bool>,
    consecutive_failures: u32,
}

impl Starvation {
    fn record_round(&mut self, launched: usize) {
        self.last_round_found_new = Some(launched > 0);
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    fn is_starved(&self) -> bool {
        self.consecutive_failures >= MAX_FAILED_DISCOVERIES
            || (self.consecutive_failures == 0 && self.last_round_found_new == Some(false))
    }
}

async fn run_worker(
    address: SocketAddr,
    handshake: PeerHandshake,
    piece_count: usize,
    config: UndertowConfig,
    scheduler: PieceScheduler,
    _active: ActiveWorker,
) -> (SocketAddr, WorkerExit) {
    let mut connection =
        match PeerConnection::connect(address, &handshake, piece_count, &config.network).await {
            Ok(connection) => connection,
            Err(e) => {
                debug!("Could not establish session with {}: {}", address, e);
                return (address, WorkerExit::ConnectionFailed(e));
            }
        };

    if let Err(e) = connection.send_interested().await {
        return (address, WorkerExit::ConnectionFailed(e));
    }
    if let Err(e) = connection.send_unchoke().await {
        return (address, WorkerExit::ConnectionFailed(e));
    }

    info!(
        "Connected to peer {} ({}/{} pieces)",
        address,
        connection.bitfield().count(),
        piece_count
    );
    let exit = scheduler.run(&mut connection).await;
    (address, exit)
}

async fn consume_results(
    results: Arc<Mutex<mpsc::Receiver<PieceResult>>>,
    output: Arc<OutputBuffer>,
    progress: Arc<DownloadProgress>,
) {
    while !progress.is_complete() {
        let next = results.lock().await.recv().await;
        let Some(result) = next else {
            break;
        };

        if let Err(e) = output.write(&result) {
            warn!("Discarding piece {}: {}", result.index, e);
            continue;
        }

        let completed = progress.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let percent = completed as f64 / progress.total as f64 * 100.0;
        info!(
            "({:.2}%) Downloaded piece #{} from {} peers",
            percent,
            result.index,
            progress.active_workers.load(Ordering::SeqCst)
        );

        if completed >= progress.total {
            progress.done.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex as SyncMutex;

    use super::*;
    use crate::torrent::test_data::{MockSeeder, SeederBehavior, TestTorrent, unreachable_address};
    use crate::torrent::{AnnounceResponse, InfoHash};

    fn coordinator() -> DownloadCoordinator {
        DownloadCoordinator::new(UndertowConfig::for_testing())
    }

    fn static_source(addresses: Vec<SocketAddr>) -> Arc<dyn PeerSource> {
        Arc::new(StaticPeerSource::new(addresses))
    }

    /// Replays scripted rounds, then reports no peers.
    struct ScriptedSource {
        rounds: SyncMutex<VecDeque<Result<Vec<SocketAddr>, TorrentError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(rounds: Vec<Result<Vec<SocketAddr>, TorrentError>>) -> Arc<Self> {
            Arc::new(Self {
                rounds: SyncMutex::new(rounds.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PeerSource for ScriptedSource {
        async fn discover(&self) -> Result<Vec<SocketAddr>, TorrentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.rounds.lock().pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    fn tracker_down() -> TorrentError {
        TorrentError::TrackerConnectionFailed {
            url: "http://tracker.invalid/announce".to_string(),
        }
    }

    #[tokio::test]
    async fn test_downloads_from_two_seeders() {
        let torrent = TestTorrent::new(32768, 4 * 32768);
        let first = MockSeeder::spawn(&torrent, SeederBehavior::default()).await;
        let second = MockSeeder::spawn(&torrent, SeederBehavior::default()).await;

        let completed = coordinator()
            .download(
                Arc::new(torrent.descriptor.clone()),
                static_source(vec![first.address(), second.address()]),
            )
            .await
            .unwrap();

        assert_eq!(completed.data, torrent.content);
        assert_eq!(completed.report.piece_count, 4);
        assert_eq!(completed.report.total_bytes, 4 * 32768);
        assert_eq!(completed.report.peers_contacted, 2);
        for seeder in [&first, &second] {
            assert!(seeder.stats().max_outstanding() <= 5);
            assert!(seeder.stats().max_request_length() <= 16384);
        }
    }

    #[tokio::test]
    async fn test_short_final_piece_is_assembled() {
        let torrent = TestTorrent::new(262144, 300000);
        let seeder = MockSeeder::spawn(&torrent, SeederBehavior::default()).await;

        let completed = coordinator()
            .download(
                Arc::new(torrent.descriptor.clone()),
                static_source(vec![seeder.address()]),
            )
            .await
            .unwrap();

        assert_eq!(completed.data.len(), 300000);
        assert_eq!(completed.data, torrent.content);
    }

    #[tokio::test]
    async fn test_duplicate_addresses_get_one_worker() {
        let torrent = TestTorrent::new(16384, 65536);
        let seeder = MockSeeder::spawn(&torrent, SeederBehavior::default()).await;
        let address = seeder.address();

        let completed = coordinator()
            .download(
                Arc::new(torrent.descriptor.clone()),
                static_source(vec![address, address, address]),
            )
            .await
            .unwrap();

        assert_eq!(completed.report.peers_contacted, 1);
        assert_eq!(seeder.stats().connections(), 1);
    }

    #[tokio::test]
    async fn test_misbehaving_peer_is_dropped_and_piece_finished_elsewhere() {
        let torrent = TestTorrent::new(16384, 4 * 16384);
        let liar = MockSeeder::spawn(
            &torrent,
            SeederBehavior {
                wrong_index_blocks: 1,
                ..SeederBehavior::default()
            },
        )
        .await;
        let honest = MockSeeder::spawn(&torrent, SeederBehavior::default()).await;

        let completed = coordinator()
            .download(
                Arc::new(torrent.descriptor.clone()),
                static_source(vec![liar.address(), honest.address()]),
            )
            .await
            .unwrap();

        assert_eq!(completed.data, torrent.content);
    }

    #[tokio::test]
    async fn test_corrupt_pieces_are_redownloaded() {
        let torrent = TestTorrent::new(16384, 4 * 16384);
        let seeder = MockSeeder::spawn(
            &torrent,
            SeederBehavior {
                corrupt_blocks: 2,
                ..SeederBehavior::default()
            },
        )
        .await;

        let completed = coordinator()
            .download(
                Arc::new(torrent.descriptor.clone()),
                static_source(vec![seeder.address()]),
            )
            .await
            .unwrap();

        assert_eq!(completed.data, torrent.content);
        assert_eq!(seeder.stats().requests(), 6);
    }

    #[tokio::test]
    async fn test_wrong_info_hash_peer_is_not_retried() {
        let torrent = TestTorrent::new(16384, 16384);
        let imposter = MockSeeder::spawn(
            &torrent,
            SeederBehavior {
                wrong_info_hash: true,
                ..SeederBehavior::default()
            },
        )
        .await;

        let result = coordinator()
            .download(
                Arc::new(torrent.descriptor.clone()),
                static_source(vec![imposter.address()]),
            )
            .await;

        assert!(matches!(
            result,
            Err(TorrentError::PeersExhausted {
                completed: 0,
                total: 1
            })
        ));
        assert_eq!(imposter.stats().connections(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_peers_exhaust_the_swarm() {
        let torrent = TestTorrent::new(16384, 32768);
        let dead = unreachable_address().await;

        let result = coordinator()
            .download(Arc::new(torrent.descriptor.clone()), static_source(vec![dead]))
            .await;

        assert!(matches!(result, Err(TorrentError::PeersExhausted { .. })));
    }

    #[tokio::test]
    async fn test_refresh_finds_peers_after_failed_discovery() {
        let torrent = TestTorrent::new(16384, 32768);
        let seeder = MockSeeder::spawn(&torrent, SeederBehavior::default()).await;
        let source = ScriptedSource::new(vec![Err(tracker_down()), Ok(vec![seeder.address()])]);

        let completed = coordinator()
            .download(Arc::new(torrent.descriptor.clone()), source.clone())
            .await
            .unwrap();

        assert_eq!(completed.data, torrent.content);
        assert!(source.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_repeated_discovery_failures_end_download() {
        let torrent = TestTorrent::new(16384, 16384);
        let source = ScriptedSource::new((0..10).map(|_| Err(tracker_down())).collect());

        let result = coordinator()
            .download(Arc::new(torrent.descriptor.clone()), source.clone())
            .await;

        assert!(matches!(result, Err(TorrentError::PeersExhausted { .. })));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline_stops_stalled_download() {
        let torrent = TestTorrent::new(16384, 32768);
        let seeder = MockSeeder::spawn(
            &torrent,
            SeederBehavior {
                ignore_requests: true,
                ..SeederBehavior::default()
            },
        )
        .await;

        let mut config = UndertowConfig::for_testing();
        config.download.deadline = Some(Duration::from_millis(300));
        let started = Instant::now();

        let result = DownloadCoordinator::new(config)
            .download(
                Arc::new(torrent.descriptor.clone()),
                static_source(vec![seeder.address()]),
            )
            .await;

        assert!(matches!(
            result,
            Err(TorrentError::DownloadTimeout {
                completed: 0,
                total: 2
            })
        ));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    /// Answers only after `delay`, like a tracker that stops responding.
    struct StalledSource {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PeerSource for StalledSource {
        async fn discover(&self) -> Result<Vec<SocketAddr>, TorrentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_deadline_covers_initial_discovery() {
        let torrent = TestTorrent::new(16384, 16384);
        let source = Arc::new(StalledSource {
            delay: Duration::from_secs(3),
            calls: AtomicUsize::new(0),
        });

        let mut config = UndertowConfig::for_testing();
        config.download.deadline = Some(Duration::from_millis(300));
        let started = Instant::now();

        let result = DownloadCoordinator::new(config)
            .download(Arc::new(torrent.descriptor.clone()), source.clone())
            .await;

        assert!(matches!(
            result,
            Err(TorrentError::DownloadTimeout {
                completed: 0,
                total: 1
            })
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    struct FixedTracker {
        url: &'static str,
        peers: Result<Vec<SocketAddr>, ()>,
        events: Arc<SyncMutex<Vec<Option<AnnounceEvent>>>>,
    }

    #[async_trait]
    impl TrackerClient for FixedTracker {
        async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
            self.events.lock().push(request.event);
            match &self.peers {
                Ok(peers) => Ok(AnnounceResponse {
                    interval: 1800,
                    min_interval: None,
                    complete: None,
                    incomplete: None,
                    peers: peers.clone(),
                }),
                Err(()) => Err(TorrentError::TrackerConnectionFailed {
                    url: self.url.to_string(),
                }),
            }
        }

        fn tracker_url(&self) -> &str {
            self.url
        }
    }

    #[tokio::test]
    async fn test_tracker_source_merges_trackers_and_marks_first_announce() {
        let descriptor = TestTorrent::new(16384, 16384).descriptor;
        let events = Arc::new(SyncMutex::new(Vec::new()));
        let a: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:6881".parse().unwrap();

        let trackers: Vec<Box<dyn TrackerClient>> = vec![
            Box::new(FixedTracker {
                url: "http://one/announce",
                peers: Ok(vec![a, b]),
                events: Arc::clone(&events),
            }),
            Box::new(FixedTracker {
                url: "http://two/announce",
                peers: Ok(vec![b]),
                events: Arc::clone(&events),
            }),
            Box::new(FixedTracker {
                url: "http://three/announce",
                peers: Err(()),
                events: Arc::clone(&events),
            }),
        ];
        let source = TrackerPeerSource::with_clients(trackers, &descriptor, PeerId::generate(), 6881);

        let mut first = source.discover().await.unwrap();
        first.sort();
        assert_eq!(first, vec![a, b]);
        source.discover().await.unwrap();

        let events = events.lock().clone();
        assert_eq!(events.len(), 6);
        assert_eq!(
            events.iter().filter(|e| **e == Some(AnnounceEvent::Started)).count(),
            3
        );
        assert_eq!(events.iter().filter(|e| e.is_none()).count(), 3);
    }

    #[tokio::test]
    async fn test_tracker_source_fails_when_every_tracker_fails() {
        let descriptor = TestTorrent::new(16384, 16384).descriptor;
        let trackers: Vec<Box<dyn TrackerClient>> = vec![Box::new(FixedTracker {
            url: "http://down/announce",
            peers: Err(()),
            events: Arc::new(SyncMutex::new(Vec::new())),
        })];
        let source = TrackerPeerSource::with_clients(trackers, &descriptor, PeerId::generate(), 6881);

        assert!(matches!(
            source.discover().await,
            Err(TorrentError::TrackerConnectionFailed { .. })
        ));
    }

    #[test]
    fn test_tracker_source_requires_http_tracker() {
        let mut descriptor = TestTorrent::new(16384, 16384).descriptor;
        descriptor.announce_urls = vec!["udp://tracker.example:80".to_string()];

        let result = TrackerPeerSource::new(&descriptor, PeerId::generate(), &UndertowConfig::default());
        assert!(matches!(result, Err(TorrentError::InvalidTorrentFile { .. })));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_rejected_up_front() {
        let descriptor = TorrentDescriptor {
            info_hash: InfoHash::new([0u8; 20]),
            name: "broken".to_string(),
            piece_length: 16384,
            total_length: 100000,
            piece_hashes: vec![[0u8; 20]],
            announce_urls: Vec::new(),
        };

        let result = coordinator()
            .download(Arc::new(descriptor), static_source(Vec::new()))
            .await;
        assert!(matches!(result, Err(TorrentError::InvalidTorrentFile { .. })));
    }
}
