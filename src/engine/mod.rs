// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The transfer engine: owns the catalog, the session registry, in-flight
//! bookkeeping and bandwidth accounting, and drives downloads.

pub mod events;
pub mod responder;
pub mod scheduler;
pub mod transfers;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::announce::{Discovery, FeeTier, Payments, TopicAnnouncer};
use crate::bandwidth::{BandwidthTracker, FileRates};
use crate::catalog::listing::{RemoteFile, RemoteListing};
use crate::catalog::store::RecordStore;
use crate::catalog::{is_valid_file_hash, Catalog, FileRecord, FileState};
use crate::errors::{CatalogError, EngineError};
use crate::networking::framer::Framer;
use crate::networking::session::{
    SessionClosed, SessionEvent, SessionRegistry, SessionRegistryParameters,
};
use crate::networking::transport::{PeerStream, Transport};
use crate::storage;
use events::{EngineEvent, Notifier};
use transfers::TransferTracker;

const SESSION_EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub download_folder: PathBuf,
    /// Address other peers reach us on, published with announcements.
    pub advertise_addr: String,
    pub default_topic: String,
    pub max_requests_per_peer: usize,
    pub chunk_receive_timeout: Duration,
    pub session_dial_timeout: Duration,
    pub session_stale_timeout: Duration,
    pub scheduler_tick: Duration,
    /// Minimum gap between dial attempts to the same unreachable seeder.
    pub redial_interval: Duration,
    pub fee_tier: FeeTier,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_folder: PathBuf::from("downloads"),
            advertise_addr: "127.0.0.1:7648".to_string(),
            default_topic: "swarmseed-public".to_string(),
            max_requests_per_peer: 8,
            chunk_receive_timeout: Duration::from_secs(120),
            session_dial_timeout: Duration::from_secs(60),
            session_stale_timeout: Duration::from_secs(60),
            scheduler_tick: Duration::from_millis(500),
            redial_interval: Duration::from_secs(10),
            fee_tier: FeeTier::default(),
        }
    }
}

pub struct EngineParameters {
    pub config: EngineConfig,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn RecordStore>,
    pub payments: Arc<dyn Payments>,
    pub discovery: Arc<dyn Discovery>,
}

pub type DownloadHandle = JoinHandle<Result<FileRecord, EngineError>>;

/// State shared by the dispatch loop, schedulers and responder tasks.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) catalog: Catalog,
    pub(crate) registry: SessionRegistry,
    pub(crate) bandwidth: Arc<BandwidthTracker>,
    pub(crate) transfers: TransferTracker,
    pub(crate) listing: RemoteListing,
    pub(crate) notifier: Notifier,
    pub(crate) announcer: Arc<TopicAnnouncer>,
    /// Woken whenever a chunk lands or a session goes away.
    pub(crate) progress: Notify,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    downloads: Mutex<HashSet<String>>,
    shutting_down: AtomicBool,
}

impl Shared {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn emit_peer_count(&self) {
        self.notifier
            .send(EngineEvent::PeerCount(self.registry.count()));
    }

    /// Called once per download when its last chunk is present.
    pub(crate) fn finish_download(&self, record: &FileRecord) {
        self.transfers.clear_file(&record.file_hash);
        event!(Level::INFO, file_hash = %record.file_hash, file_name = %record.file_name, "Download finished");
        self.notifier.send(EngineEvent::DownloadFinished {
            file_hash: record.file_hash.clone(),
            file_name: record.file_name.clone(),
        });
        self.announce(record.clone());
        self.progress.notify_waiters();
    }

    /// Announces in the background. Failures are reported, never fatal.
    pub(crate) fn announce(&self, record: FileRecord) {
        let announcer = self.announcer.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = announcer.announce(&record).await {
                notifier.error("announce", format!("{}: {}", record.file_name, e));
            }
        });
    }

    /// Tears down everything tied to a closed session. Only the close of the
    /// session currently registered for the address does anything, so a
    /// session's bookkeeping is released exactly once.
    async fn purge_session(&self, closed: SessionClosed) {
        if !self.registry.remove_if_current(&closed.addr, closed.id) {
            return;
        }

        let released = self.transfers.release_peer(&closed.addr);
        let changed = match self.catalog.remove_seeder_everywhere(&closed.addr).await {
            Ok(changed) => changed,
            Err(e) => {
                event!(Level::WARN, peer = %closed.addr, "Failed to persist seeder removal: {}", e);
                Vec::new()
            }
        };
        let dropped = self.listing.remove_seeder(&closed.addr);

        event!(
            Level::INFO,
            peer = %closed.addr,
            released = released.len(),
            files = changed.len(),
            unlisted = dropped.len(),
            "Session removed"
        );
        self.emit_peer_count();
        self.progress.notify_waiters();
    }

    fn start_download(self: &Arc<Self>, file_hash: String, fetch: Vec<u64>) -> Result<DownloadHandle, EngineError> {
        {
            let mut downloads = self.downloads.lock().unwrap_or_else(|e| e.into_inner());
            if !downloads.insert(file_hash.clone()) {
                return Err(EngineError::AlreadyDownloading(file_hash));
            }
        }

        let guard = DownloadGuard {
            shared: self.clone(),
            file_hash: file_hash.clone(),
        };
        let shared = self.clone();
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let result = scheduler::run_download(shared.clone(), file_hash.clone(), fetch).await;
            if let Err(e) = &result {
                if !matches!(e, EngineError::ShuttingDown) {
                    shared.notifier.error("download", format!("{}: {}", file_hash, e));
                }
            }
            result
        }))
    }

    /// Hashes a local seed, then starts seeding it. A file that cannot be
    /// read in full is marked missing.
    fn verify_in_background(self: &Arc<Self>, record: FileRecord) {
        let shared = self.clone();
        tokio::spawn(async move {
            match storage::hash_file(&record.local_path, record.file_size).await {
                Ok(digest) => match shared.catalog.finish_hashing(&record.file_hash, digest).await {
                    Ok(record) => {
                        event!(Level::INFO, file_hash = %record.file_hash, "Integrity pass complete, seeding");
                        shared.announce(record);
                    }
                    Err(e) => shared.notifier.error("seed", e),
                },
                Err(e) => {
                    shared
                        .notifier
                        .error("seed", format!("{}: {}", record.local_path.display(), e));
                    if let Err(e) = shared
                        .catalog
                        .transition(&record.file_hash, FileState::Missing)
                        .await
                    {
                        event!(Level::WARN, file_hash = %record.file_hash, "Could not mark file missing: {}", e);
                    }
                }
            }
        });
    }
}

struct DownloadGuard {
    shared: Arc<Shared>,
    file_hash: String,
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        let mut downloads = self
            .shared
            .downloads
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        downloads.remove(&self.file_hash);
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut events_rx: mpsc::Receiver<SessionEvent>,
    mut closed_rx: mpsc::UnboundedReceiver<SessionClosed>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(event) = events_rx.recv() => {
                tokio::spawn(responder::handle_event(shared.clone(), event));
            }
            Some(closed) = closed_rx.recv() => {
                shared.purge_session(closed).await;
            }
            _ = shutdown_rx.recv() => {
                event!(Level::DEBUG, "Dispatch loop shutting down");
                break;
            }
            else => break,
        }
    }
}

/// A random 128-bit identity in 8-4-4-4-12 hex groups.
pub fn random_file_hash() -> String {
    let hex = hex::encode(rand::random::<[u8; 16]>());
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Keeps only the final path component so a remote name cannot escape the
/// download folder.
fn local_file_name(file_name: &str, file_hash: &str) -> String {
    Path::new(file_name)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| file_hash.to_string())
}

#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Builds the engine, starts its dispatch loop and reconciles the
    /// persisted catalog with what is on disk.
    pub async fn start(params: EngineParameters) -> Result<Self, EngineError> {
        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_QUEUE);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let bandwidth = Arc::new(BandwidthTracker::new());
        let registry = SessionRegistry::new(SessionRegistryParameters {
            transport: params.transport,
            framer: Framer::new(bandwidth.clone()),
            events_tx,
            closed_tx,
            shutdown_tx: shutdown_tx.clone(),
        });
        let announcer = Arc::new(TopicAnnouncer::new(
            params.payments,
            params.discovery,
            params.config.fee_tier,
            params.config.advertise_addr.clone(),
        ));

        let shared = Arc::new(Shared {
            config: params.config,
            catalog: Catalog::new(params.store),
            registry,
            bandwidth,
            transfers: TransferTracker::new(),
            listing: RemoteListing::new(),
            notifier: Notifier::new(),
            announcer,
            progress: Notify::new(),
            shutdown_tx: shutdown_tx.clone(),
            downloads: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
        });

        tokio::spawn(dispatch_loop(
            shared.clone(),
            events_rx,
            closed_rx,
            shutdown_tx.subscribe(),
        ));

        let engine = Engine { shared };
        engine.reconcile().await?;
        Ok(engine)
    }

    /// Reloads every persisted record and puts each back to work.
    async fn reconcile(&self) -> Result<(), EngineError> {
        let records = self.shared.catalog.load().await?;
        for record in records {
            let present = tokio::fs::try_exists(&record.local_path)
                .await
                .unwrap_or(false);

            match record.state {
                FileState::Missing | FileState::Discovered => {}
                _ if !present => {
                    event!(Level::WARN, file_hash = %record.file_hash, path = %record.local_path.display(), "Backing file is gone, marking missing");
                    self.shared
                        .catalog
                        .transition(&record.file_hash, FileState::Missing)
                        .await?;
                }
                FileState::Hashing => self.shared.verify_in_background(record),
                FileState::Seeding => self.shared.announce(record),
                FileState::Downloading => {
                    let _handle = self.restart_download(&record.file_hash)?;
                }
            }
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.shared.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    /// Starts seeding a local file under a fresh random hash.
    pub async fn seed_file(&self, path: &Path, topic: Option<&str>) -> Result<FileRecord, EngineError> {
        self.ensure_running()?;
        let local_path = tokio::fs::canonicalize(path)
            .await
            .map_err(crate::errors::StorageError::from)?;
        if self.shared.catalog.find_by_path(&local_path).is_some() {
            return Err(EngineError::AlreadySeeded(local_path.display().to_string()));
        }

        let file_size = storage::file_size(&local_path).await?;
        let file_name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let topic = topic.unwrap_or(self.shared.config.default_topic.as_str());

        let record = FileRecord::local(&random_file_hash(), &file_name, file_size, local_path, topic);
        self.shared.catalog.create(record.clone()).await?;
        event!(Level::INFO, file_hash = %record.file_hash, file_name = %record.file_name, size = file_size, "Seeding file");

        self.shared.verify_in_background(record.clone());
        Ok(record)
    }

    /// Records a file advertised by discovery. Known seeders of a file that
    /// is already in the catalog are merged into its record.
    pub async fn add_remote_file(&self, mut file: RemoteFile) -> Result<RemoteFile, EngineError> {
        if !is_valid_file_hash(&file.file_hash) {
            return Err(EngineError::InvalidFileHash(file.file_hash));
        }
        file.seeders.remove(&self.shared.config.advertise_addr);
        if file.seeders.is_empty() {
            return Ok(file);
        }

        let merged = self.shared.listing.add(file);
        if self.shared.catalog.get(&merged.file_hash).is_some() {
            self.shared
                .catalog
                .add_seeders(&merged.file_hash, merged.seeders.iter().cloned())
                .await?;
            self.shared.progress.notify_waiters();
        }
        Ok(merged)
    }

    pub fn remote_files(&self) -> Vec<RemoteFile> {
        self.shared.listing.all()
    }

    /// Starts fetching a listed file. A file already in the catalog is resumed,
    /// or reported complete if it is already seeding.
    pub async fn download_file_by_hash(&self, file_hash: &str) -> Result<DownloadHandle, EngineError> {
        self.ensure_running()?;
        if !is_valid_file_hash(file_hash) {
            return Err(EngineError::InvalidFileHash(file_hash.to_string()));
        }

        if let Some(record) = self.shared.catalog.get(file_hash) {
            return match record.state {
                FileState::Downloading => self.restart_download(file_hash),
                FileState::Seeding => Ok(tokio::spawn(async move { Ok(record) })),
                FileState::Discovered => self.begin_download(record).await,
                state => Err(CatalogError::InvalidTransition {
                    file_hash: file_hash.to_string(),
                    from: state,
                    to: FileState::Downloading,
                }
                .into()),
            };
        }

        let remote = self
            .shared
            .listing
            .get(file_hash)
            .ok_or_else(|| EngineError::NotListed(file_hash.to_string()))?;
        let file_name = local_file_name(&remote.file_name, &remote.file_hash);
        let local_path = self.shared.config.download_folder.join(&file_name);

        let record = FileRecord::remote(
            &remote.file_hash,
            &file_name,
            remote.file_size,
            local_path,
            &remote.topic,
            remote.seeders.iter().cloned(),
        );
        self.shared.catalog.create(record.clone()).await?;
        self.begin_download(record).await
    }

    async fn begin_download(&self, record: FileRecord) -> Result<DownloadHandle, EngineError> {
        storage::allocate_file(&record.local_path, record.file_size).await?;
        let record = self
            .shared
            .catalog
            .transition(&record.file_hash, FileState::Downloading)
            .await?;

        self.shared.notifier.send(EngineEvent::DownloadStarted {
            file_hash: record.file_hash.clone(),
            file_name: record.file_name.clone(),
        });
        let fetch: Vec<u64> = (0..record.num_chunks).collect();
        self.shared.start_download(record.file_hash, fetch)
    }

    /// Resumes a download with whatever chunks are still missing.
    pub fn restart_download(&self, file_hash: &str) -> Result<DownloadHandle, EngineError> {
        self.ensure_running()?;
        let record = self
            .shared
            .catalog
            .get(file_hash)
            .ok_or_else(|| CatalogError::NotFound(file_hash.to_string()))?;
        if record.state != FileState::Downloading {
            return Err(CatalogError::NotDownloading {
                file_hash: file_hash.to_string(),
                state: record.state,
            }
            .into());
        }

        let missing = record.chunk_map.missing();
        event!(Level::INFO, file_hash, missing = missing.len(), "Resuming download");
        self.shared.start_download(record.file_hash, missing)
    }

    pub fn accept_inbound(&self, stream: PeerStream, addr: &str) {
        self.shared.registry.accept_inbound(stream, addr);
        self.shared.emit_peer_count();
    }

    pub fn connected_peers(&self) -> usize {
        self.shared.registry.count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.notifier.subscribe()
    }

    pub fn file(&self, file_hash: &str) -> Option<FileRecord> {
        self.shared.catalog.get(file_hash)
    }

    pub fn files(&self) -> Vec<FileRecord> {
        self.shared.catalog.all()
    }

    pub fn in_flight(&self, file_hash: &str) -> usize {
        self.shared.transfers.in_flight_count(file_hash)
    }

    pub fn sample_bandwidth(&self, elapsed: Duration) -> HashMap<String, FileRates> {
        self.shared.bandwidth.sample(elapsed)
    }

    pub fn bandwidth_rates(&self) -> HashMap<String, FileRates> {
        self.shared.bandwidth.rates()
    }

    pub async fn leave_topic(&self, topic: &str) -> Result<(), EngineError> {
        self.shared.announcer.leave_topic(topic).await?;
        Ok(())
    }

    /// Stops session loops, the dispatch loop and every scheduler. In-flight
    /// markers are simply dropped; a resume recomputes from the bitmap.
    pub fn shutdown(&self) {
        if !self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            event!(Level::INFO, "Engine shutting down");
            let _ = self.shared.shutdown_tx.send(());
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use tokio::time::{sleep, timeout};

    use crate::announce::tests::ScriptedPayments;
    use crate::announce::{LocalPayments, SeedList};
    use crate::catalog::chunk_map::ChunkMap;
    use crate::catalog::store::{DirStore, FlakyStore, MemoryStore};
    use crate::networking::protocol::{encode_message, Message};
    use crate::networking::transport::memory::MemoryNetwork;
    use crate::CHUNK_SIZE;

    const WAIT: Duration = Duration::from_secs(20);

    fn test_config(addr: &str, dir: &Path) -> EngineConfig {
        EngineConfig {
            download_folder: dir.to_path_buf(),
            advertise_addr: addr.to_string(),
            chunk_receive_timeout: Duration::from_secs(10),
            session_dial_timeout: Duration::from_millis(500),
            session_stale_timeout: Duration::from_secs(10),
            scheduler_tick: Duration::from_millis(20),
            redial_interval: Duration::from_millis(100),
            ..EngineConfig::default()
        }
    }

    struct Node {
        engine: Engine,
        seeds: Arc<SeedList>,
        dir: tempfile::TempDir,
    }

    async fn start_engine(
        transport: Arc<dyn Transport>,
        store: Arc<dyn RecordStore>,
        payments: Arc<dyn Payments>,
        config: EngineConfig,
    ) -> (Engine, Arc<SeedList>) {
        let seeds = Arc::new(SeedList::new());
        let engine = Engine::start(EngineParameters {
            config,
            transport,
            store,
            payments,
            discovery: seeds.clone(),
        })
        .await
        .unwrap();
        (engine, seeds)
    }

    /// Starts an engine reachable at `addr` on the memory network.
    async fn start_node(
        network: &Arc<MemoryNetwork>,
        addr: &str,
        configure: impl FnOnce(&mut EngineConfig),
    ) -> Node {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(addr, dir.path());
        configure(&mut config);

        let mut incoming = network.listen(addr);
        let (engine, seeds) = start_engine(
            Arc::new(network.transport_for(addr)),
            Arc::new(MemoryStore::new()),
            Arc::new(LocalPayments),
            config,
        )
        .await;

        let acceptor = engine.clone();
        tokio::spawn(async move {
            while let Some((stream, peer)) = incoming.recv().await {
                acceptor.accept_inbound(Box::new(stream), &peer);
            }
        });
        Node { engine, seeds, dir }
    }

    async fn wait_for(what: &str, condition: impl Fn() -> bool) {
        let polled = timeout(WAIT, async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(polled.is_ok(), "timed out waiting for {}", what);
    }

    fn patterned(len: u64) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn remote(file_hash: &str, size: u64, seeders: &[&str]) -> RemoteFile {
        RemoteFile {
            file_hash: file_hash.to_string(),
            file_name: "payload.bin".to_string(),
            file_size: size,
            topic: "swarmseed-public".to_string(),
            seeders: seeders.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn chunk_of(content: &[u8], index: u64) -> Vec<u8> {
        let start = (index * CHUNK_SIZE) as usize;
        let end = (start + CHUNK_SIZE as usize).min(content.len());
        content[start..end].to_vec()
    }

    /// A peer speaking raw frames. It answers requests from `content`, skips
    /// the ones `drop_request` picks, and sends each answer `copies` times.
    fn spawn_scripted_peer(
        network: &Arc<MemoryNetwork>,
        addr: &str,
        content: Vec<u8>,
        copies: usize,
        drop_request: impl Fn(usize) -> bool + Send + 'static,
        requests: Arc<AtomicUsize>,
        served: Arc<AtomicUsize>,
    ) {
        let mut incoming = network.listen(addr);
        tokio::spawn(async move {
            while let Some((stream, _)) = incoming.recv().await {
                let (mut reader, mut writer) = tokio::io::split(stream);
                let framer = Framer::new(Arc::new(BandwidthTracker::new()));
                while let Ok(decoded) = framer.read_message(&mut reader).await {
                    let Ok(Message::ChunkRequest {
                        file_id,
                        chunk_index,
                    }) = decoded
                    else {
                        continue;
                    };
                    let seen = requests.fetch_add(1, Ordering::SeqCst);
                    if drop_request(seen) {
                        continue;
                    }
                    for _ in 0..copies {
                        let delivery = Message::ChunkDelivery {
                            file_id: file_id.clone(),
                            chunk_index,
                            data: chunk_of(&content, chunk_index),
                        };
                        if framer.write_message(&mut writer, delivery).await.is_err() {
                            return;
                        }
                        served.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn test_download_from_live_seeder_with_one_unreachable() {
        let network = MemoryNetwork::new();
        let seeder = start_node(&network, "seed-a", |_| {}).await;
        let leecher = start_node(&network, "leech", |_| {}).await;

        let size = 10 * CHUNK_SIZE;
        let content = patterned(size);
        let source = seeder.dir.path().join("big.bin");
        tokio::fs::write(&source, &content).await.unwrap();

        let seeded = seeder.engine.seed_file(&source, None).await.unwrap();
        let hash = seeded.file_hash.clone();
        wait_for("seeding", || {
            seeder.engine.file(&hash).map(|r| r.state) == Some(FileState::Seeding)
        })
        .await;

        leecher
            .engine
            .add_remote_file(remote(&hash, size, &["seed-a", "ghost"]))
            .await
            .unwrap();
        let handle = leecher.engine.download_file_by_hash(&hash).await.unwrap();
        let record = timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

        assert_eq!(record.state, FileState::Seeding);
        assert!(record.is_complete());
        let fetched = tokio::fs::read(&record.local_path).await.unwrap();
        assert_eq!(fetched, content);

        let expected = seeder.engine.file(&hash).unwrap().content_digest.unwrap();
        assert_eq!(storage::hash_file(&record.local_path, size).await.unwrap(), expected);
        assert_eq!(leecher.engine.in_flight(&hash), 0);
        assert!(leecher.engine.shared().bandwidth.snapshot(&hash).downloaded >= size);
        assert!(seeder.engine.shared().bandwidth.snapshot(&hash).uploaded >= size);
    }

    #[tokio::test]
    async fn test_dropped_request_is_dispatched_again() {
        let network = MemoryNetwork::new();
        let size = 2 * CHUNK_SIZE + 100;
        let content = patterned(size);
        let requests = Arc::new(AtomicUsize::new(0));
        let served = Arc::new(AtomicUsize::new(0));
        spawn_scripted_peer(
            &network,
            "flaky",
            content.clone(),
            1,
            |seen| seen == 0,
            requests.clone(),
            served.clone(),
        );

        let leecher = start_node(&network, "leech", |config| {
            config.chunk_receive_timeout = Duration::from_millis(500);
        })
        .await;
        leecher
            .engine
            .add_remote_file(remote("f-1", size, &["flaky"]))
            .await
            .unwrap();
        let handle = leecher.engine.download_file_by_hash("f-1").await.unwrap();
        let record = timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

        assert_eq!(tokio::fs::read(&record.local_path).await.unwrap(), content);
        let requests = requests.load(Ordering::SeqCst);
        assert!(requests >= 4);
        assert_eq!(served.load(Ordering::SeqCst), requests - 1);
        assert_eq!(leecher.engine.in_flight("f-1"), 0);
    }

    #[tokio::test]
    async fn test_stale_session_is_removed_and_released() {
        let network = MemoryNetwork::new();
        let requests = Arc::new(AtomicUsize::new(0));
        spawn_scripted_peer(
            &network,
            "mute",
            Vec::new(),
            1,
            |_| true,
            requests.clone(),
            Arc::new(AtomicUsize::new(0)),
        );

        let leecher = start_node(&network, "leech", |config| {
            config.session_stale_timeout = Duration::from_millis(200);
        })
        .await;
        leecher
            .engine
            .add_remote_file(remote("f-2", 3 * CHUNK_SIZE, &["mute"]))
            .await
            .unwrap();
        let handle = leecher.engine.download_file_by_hash("f-2").await.unwrap();

        wait_for("requests", || requests.load(Ordering::SeqCst) == 3).await;
        let engine = leecher.engine.clone();
        wait_for("seeder purge", move || {
            engine.file("f-2").is_some_and(|r| r.seeders.is_empty())
        })
        .await;

        assert_eq!(leecher.engine.in_flight("f-2"), 0);
        assert_eq!(leecher.engine.shared().transfers.load("mute"), 0);
        assert_eq!(leecher.engine.connected_peers(), 0);
        assert!(leecher.engine.remote_files().is_empty());
        assert!(!handle.is_finished());

        leecher.engine.shutdown();
        let result = timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(EngineError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_ignored_but_counted() {
        let network = MemoryNetwork::new();
        let content = patterned(4096);
        spawn_scripted_peer(
            &network,
            "echo",
            content.clone(),
            2,
            |_| false,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );

        let leecher = start_node(&network, "leech", |_| {}).await;
        leecher
            .engine
            .add_remote_file(remote("f-3", 4096, &["echo"]))
            .await
            .unwrap();
        let handle = leecher.engine.download_file_by_hash("f-3").await.unwrap();
        let record = timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

        let (_, payload) = encode_message(Message::ChunkDelivery {
            file_id: "f-3".to_string(),
            chunk_index: 0,
            data: content.clone(),
        })
        .unwrap();
        let bandwidth = leecher.engine.shared().bandwidth.clone();
        let expected = 2 * payload.len() as u64;
        wait_for("second delivery", || bandwidth.snapshot("f-3").downloaded == expected).await;

        let after = leecher.engine.file("f-3").unwrap();
        assert_eq!(after.state, FileState::Seeding);
        assert_eq!(after.chunk_map.count(), 1);
        assert_eq!(tokio::fs::read(&record.local_path).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_resume_of_complete_file_needs_no_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.bin");
        tokio::fs::write(&path, patterned(2 * CHUNK_SIZE)).await.unwrap();

        let mut record = FileRecord::remote(
            "f-4",
            "done.bin",
            2 * CHUNK_SIZE,
            path,
            "t",
            ["nobody".to_string()],
        );
        record.state = FileState::Downloading;
        record.chunk_map = ChunkMap::full(2);
        let store = Arc::new(MemoryStore::new());
        store.insert_or_update(&record).unwrap();

        let network = MemoryNetwork::new();
        let (engine, _) = start_engine(
            Arc::new(network.transport_for("leech")),
            store,
            Arc::new(LocalPayments),
            test_config("leech", dir.path()),
        )
        .await;

        wait_for("seeding", || {
            engine.file("f-4").map(|r| r.state) == Some(FileState::Seeding)
        })
        .await;
        assert_eq!(engine.connected_peers(), 0);
        assert_eq!(engine.in_flight("f-4"), 0);
    }

    #[tokio::test]
    async fn test_seed_file_hashes_then_announces() {
        let network = MemoryNetwork::new();
        let node = start_node(&network, "me", |_| {}).await;
        let path = node.dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let record = node.engine.seed_file(&path, Some("docs")).await.unwrap();
        assert_eq!(record.state, FileState::Hashing);
        assert_eq!(record.num_chunks, 1);
        let groups: Vec<usize> = record.file_hash.split('-').map(str::len).collect();
        assert_eq!(groups, vec![8, 4, 4, 4, 12]);

        let hash = record.file_hash.clone();
        wait_for("seeding", || {
            node.engine.file(&hash).map(|r| r.state) == Some(FileState::Seeding)
        })
        .await;
        assert_eq!(
            node.engine.file(&hash).unwrap().content_digest.as_deref(),
            Some("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
        );
        let seeds = node.seeds.clone();
        wait_for("announcement", move || seeds.files("docs").len() == 1).await;

        assert!(matches!(
            node.engine.seed_file(&path, None).await,
            Err(EngineError::AlreadySeeded(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_marks_deleted_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = FileRecord::local("f-5", "gone.bin", 10, dir.path().join("gone.bin"), "t");
        record.state = FileState::Seeding;
        let store = Arc::new(MemoryStore::new());
        store.insert_or_update(&record).unwrap();

        let network = MemoryNetwork::new();
        let (engine, _) = start_engine(
            Arc::new(network.transport_for("me")),
            store.clone(),
            Arc::new(LocalPayments),
            test_config("me", dir.path()),
        )
        .await;

        assert_eq!(engine.file("f-5").unwrap().state, FileState::Missing);
        assert_eq!(
            store.get_file("f-5").unwrap().unwrap().state,
            FileState::Missing
        );
    }

    #[tokio::test]
    async fn test_announce_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let (engine, seeds) = start_engine(
            Arc::new(network.transport_for("me")),
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedPayments {
                fee: 3,
                insufficient: true,
                ..Default::default()
            }),
            test_config("me", dir.path()),
        )
        .await;
        let mut events = engine.subscribe();

        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"abc").await.unwrap();
        let record = engine.seed_file(&path, None).await.unwrap();

        let reported = timeout(WAIT, async {
            loop {
                if let Ok(EngineEvent::Error { label, .. }) = events.recv().await {
                    if label == "announce" {
                        break;
                    }
                }
            }
        })
        .await;
        assert!(reported.is_ok());
        assert_eq!(engine.file(&record.file_hash).unwrap().state, FileState::Seeding);
        assert!(seeds.files("swarmseed-public").is_empty());
    }

    #[tokio::test]
    async fn test_download_requests_are_validated() {
        let network = MemoryNetwork::new();
        let node = start_node(&network, "leech", |_| {}).await;

        assert!(matches!(
            node.engine.download_file_by_hash("unknown").await,
            Err(EngineError::NotListed(_))
        ));

        node.engine
            .add_remote_file(remote("f-6", 100, &["ghost"]))
            .await
            .unwrap();
        let handle = node.engine.download_file_by_hash("f-6").await.unwrap();
        assert!(matches!(
            node.engine.download_file_by_hash("f-6").await,
            Err(EngineError::AlreadyDownloading(_))
        ));

        node.engine.shutdown();
        let result = timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(EngineError::ShuttingDown)));
        assert!(matches!(
            node.engine.download_file_by_hash("f-6").await,
            Err(EngineError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_own_address_is_not_a_seeder() {
        let network = MemoryNetwork::new();
        let node = start_node(&network, "me", |_| {}).await;
        let listed = node
            .engine
            .add_remote_file(remote("f-7", 100, &["me", "other"]))
            .await
            .unwrap();
        assert_eq!(listed.seeders.len(), 1);
        assert!(listed.seeders.contains("other"));
    }

    #[tokio::test]
    async fn test_hashes_naming_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let (engine, _) = start_engine(
            Arc::new(network.transport_for("me")),
            Arc::new(DirStore::open(dir.path().join("catalog")).unwrap()),
            Arc::new(LocalPayments),
            test_config("me", dir.path()),
        )
        .await;

        assert!(matches!(
            engine
                .add_remote_file(remote("../escaped", 100, &["peer"]))
                .await,
            Err(EngineError::InvalidFileHash(_))
        ));
        assert!(matches!(
            engine.download_file_by_hash("../escaped").await,
            Err(EngineError::InvalidFileHash(_))
        ));
        assert!(engine.remote_files().is_empty());
        assert!(engine.files().is_empty());
        assert!(!dir.path().join("escaped.toml").exists());
        assert!(!dir.path().join("escaped.toml.tmp").exists());
    }

    #[tokio::test]
    async fn test_download_finishes_after_rejected_final_write() {
        let network = MemoryNetwork::new();
        let content = patterned(4096);
        let requests = Arc::new(AtomicUsize::new(0));
        spawn_scripted_peer(
            &network,
            "steady",
            content.clone(),
            1,
            |_| false,
            requests.clone(),
            Arc::new(AtomicUsize::new(0)),
        );

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(FileState::Seeding, 1));
        let (engine, _) = start_engine(
            Arc::new(network.transport_for("leech")),
            store.clone(),
            Arc::new(LocalPayments),
            test_config("leech", dir.path()),
        )
        .await;
        let mut events = engine.subscribe();

        engine
            .add_remote_file(remote("f-8", 4096, &["steady"]))
            .await
            .unwrap();
        let handle = engine.download_file_by_hash("f-8").await.unwrap();
        let record = timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(record.state, FileState::Seeding);

        let finished = timeout(WAIT, async {
            loop {
                if let Ok(EngineEvent::DownloadFinished { file_hash, .. }) = events.recv().await {
                    break file_hash;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(finished, "f-8");

        // The rejected landing was requested a second time.
        assert!(requests.load(Ordering::SeqCst) >= 2);
        assert_eq!(
            store.get_file("f-8").unwrap().unwrap().state,
            FileState::Seeding
        );
        assert_eq!(tokio::fs::read(&record.local_path).await.unwrap(), content);
    }

    #[test]
    fn test_local_file_name_stays_in_folder() {
        assert_eq!(local_file_name("../../etc/passwd", "h"), "passwd");
        assert_eq!(local_file_name("movie.mkv", "h"), "movie.mkv");
        assert_eq!(local_file_name("..", "h"), "h");
        assert_eq!(local_file_name("", "h"), "h");
    }
}
