// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{event, Level};

use super::Shared;
use crate::catalog::chunk_map::ChunkMap;
use crate::catalog::{FileRecord, FileState};
use crate::errors::{CatalogError, EngineError, SessionError};
use crate::networking::protocol::Message;
use crate::networking::session::Session;

type DialResult = (String, Result<Arc<Session>, SessionError>);

/// A uniformly random ordering of the fetch set.
pub fn fetch_order(fetch: &[u64]) -> Vec<u64> {
    let mut order = fetch.to_vec();
    order.shuffle(&mut rand::rng());
    order
}

/// Chunks of one download that still need a request, in fetch order, and
/// the chunks handed out since. Each wake-up only looks at the handed-out
/// set, which is bounded by the request limits, never at the whole file.
#[derive(Debug, Default)]
struct FetchQueue {
    eligible: VecDeque<u64>,
    handed_out: HashSet<u64>,
}

impl FetchQueue {
    fn new(order: Vec<u64>) -> Self {
        Self {
            eligible: order.into(),
            handed_out: HashSet::new(),
        }
    }

    /// Forgets handed-out chunks that have landed and puts the ones whose
    /// request was released or expired back at the end of the queue.
    fn reconcile(&mut self, shared: &Shared, file_hash: &str, present: &ChunkMap) {
        let eligible = &mut self.eligible;
        self.handed_out.retain(|&index| {
            if present.is_set(index) {
                return false;
            }
            if shared.transfers.marker(file_hash, index).is_none() {
                eligible.push_back(index);
                return false;
            }
            true
        });
    }

    /// The next chunk that is not present yet.
    fn next(&mut self, present: &ChunkMap) -> Option<u64> {
        while let Some(index) = self.eligible.pop_front() {
            if !present.is_set(index) {
                self.handed_out.insert(index);
                return Some(index);
            }
        }
        None
    }
}

/// Seeders usable by one download, and the dials still in progress.
#[derive(Default)]
struct SeederPool {
    active: BTreeMap<String, Arc<Session>>,
    dialing: HashSet<String>,
    last_dial: HashMap<String, Instant>,
    dials: JoinSet<DialResult>,
    stalled: bool,
}

impl SeederPool {
    /// Adopts live sessions directly and dials the rest, each on its own task.
    fn dial_missing(&mut self, shared: &Arc<Shared>, seeders: &BTreeSet<String>) {
        for addr in seeders {
            if self.active.contains_key(addr) || self.dialing.contains(addr) {
                continue;
            }
            if let Some(session) = shared.registry.get(addr) {
                // A closed session stays registered until its teardown runs.
                if !session.is_closed() {
                    self.active.insert(addr.clone(), session);
                }
                continue;
            }
            if let Some(last) = self.last_dial.get(addr) {
                if last.elapsed() < shared.config.redial_interval {
                    continue;
                }
            }

            self.dialing.insert(addr.clone());
            self.last_dial.insert(addr.clone(), Instant::now());
            let shared = shared.clone();
            let addr = addr.clone();
            self.dials.spawn(async move {
                let result = shared
                    .registry
                    .get_or_dial(&addr, shared.config.session_dial_timeout)
                    .await;
                (addr, result)
            });
        }
    }

    fn on_dial(&mut self, shared: &Shared, result: Result<DialResult, JoinError>) {
        match result {
            Ok((addr, Ok(session))) => {
                self.dialing.remove(&addr);
                event!(Level::DEBUG, peer = %addr, "Seeder connected");
                self.active.insert(addr, session);
                shared.emit_peer_count();
            }
            Ok((addr, Err(e))) => {
                self.dialing.remove(&addr);
                event!(Level::DEBUG, peer = %addr, "Seeder excluded from this round: {}", e);
            }
            Err(e) => {
                event!(Level::WARN, "Dial task failed: {}", e);
            }
        }
    }

    /// Forgets sessions that have since been replaced or torn down.
    fn prune_closed(&mut self, shared: &Shared) {
        self.active.retain(|addr, session| {
            !session.is_closed()
                && shared
                    .registry
                    .get(addr)
                    .is_some_and(|current| current.id() == session.id())
        });
    }

    /// Closes sessions that owe us chunks but have gone quiet for longer than
    /// the staleness window. Their markers are released when the close lands.
    fn reap_stale(&mut self, shared: &Shared) {
        let window = shared.config.session_stale_timeout;
        self.active.retain(|addr, session| {
            let oldest = shared.transfers.oldest_request_age(addr);
            let stale = oldest.is_some_and(|age| age > window) && session.idle_for() > window;
            if stale {
                event!(Level::WARN, peer = %addr, idle = ?session.idle_for(), "Session went stale, closing");
                session.close();
            }
            !stale
        });
    }

    /// Hands out queued chunks to the least-loaded seeders until every
    /// seeder is at its limit or the queue runs dry.
    fn dispatch(
        &mut self,
        shared: &Arc<Shared>,
        file_hash: &str,
        queue: &mut FetchQueue,
        present: &ChunkMap,
    ) {
        let peers: Vec<String> = self.active.keys().cloned().collect();
        if peers.is_empty() {
            if !self.stalled {
                event!(Level::INFO, file_hash, "Download stalled, no active seeders");
                self.stalled = true;
            }
            return;
        }
        self.stalled = false;

        let max = shared.config.max_requests_per_peer;
        while let Some(peer) = shared.transfers.least_loaded(&peers, max) {
            let Some(chunk_index) = queue.next(present) else {
                break;
            };
            // A refused claim stays handed out and is requeued once its
            // marker clears.
            if !shared.transfers.try_mark(file_hash, chunk_index, peer, max) {
                continue;
            }
            let Some(session) = self.active.get(peer).cloned() else {
                shared.transfers.release(file_hash, chunk_index);
                continue;
            };

            let shared = shared.clone();
            let file_id = file_hash.to_string();
            tokio::spawn(async move {
                let request = Message::ChunkRequest {
                    file_id: file_id.clone(),
                    chunk_index,
                };
                if let Err(e) = session.send(request).await {
                    event!(Level::DEBUG, peer = %session.addr(), chunk = chunk_index, "Request not sent: {}", e);
                    shared.transfers.release(&file_id, chunk_index);
                }
            });
        }
    }
}

/// Drives one download until every chunk in `fetch` is present.
pub(crate) async fn run_download(
    shared: Arc<Shared>,
    file_hash: String,
    fetch: Vec<u64>,
) -> Result<FileRecord, EngineError> {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    if shared.is_shutting_down() {
        return Err(EngineError::ShuttingDown);
    }

    let record = shared
        .catalog
        .get(&file_hash)
        .ok_or_else(|| CatalogError::NotFound(file_hash.clone()))?;
    let order: Vec<u64> = fetch_order(&fetch)
        .into_iter()
        .filter(|&index| !record.chunk_map.is_set(index))
        .collect();

    if order.is_empty() {
        return complete(&shared, &file_hash).await;
    }

    event!(
        Level::INFO,
        file_hash = %file_hash,
        chunks = order.len(),
        seeders = record.seeders.len(),
        "Download started"
    );

    let mut queue = FetchQueue::new(order);
    let mut pool = SeederPool::default();
    pool.dial_missing(&shared, &record.seeders);
    loop {
        tokio::select! {
            result = pool.dials.join_next() => match result {
                Some(result) => pool.on_dial(&shared, result),
                None => break,
            },
            _ = shutdown_rx.recv() => return Err(EngineError::ShuttingDown),
        }
    }

    let mut tick = tokio::time::interval(shared.config.scheduler_tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let record = shared
            .catalog
            .get(&file_hash)
            .ok_or_else(|| CatalogError::NotFound(file_hash.clone()))?;
        match record.state {
            FileState::Downloading => {}
            FileState::Seeding => return Ok(record),
            state => {
                return Err(CatalogError::NotDownloading {
                    file_hash: file_hash.clone(),
                    state,
                }
                .into())
            }
        }

        // Chunks outside the fetch set were already present when it was
        // built, so a full map means the fetch set is done.
        if record.chunk_map.is_complete() {
            return complete(&shared, &file_hash).await;
        }

        let requeued = shared
            .transfers
            .expire(&file_hash, shared.config.chunk_receive_timeout);
        if !requeued.is_empty() {
            event!(Level::DEBUG, file_hash = %file_hash, ?requeued, "Chunk requests timed out");
        }
        queue.reconcile(&shared, &file_hash, &record.chunk_map);

        pool.reap_stale(&shared);
        pool.prune_closed(&shared);
        pool.dial_missing(&shared, &record.seeders);
        pool.dispatch(&shared, &file_hash, &mut queue, &record.chunk_map);

        tokio::select! {
            _ = shared.progress.notified() => {}
            _ = tick.tick() => {}
            Some(result) = pool.dials.join_next() => pool.on_dial(&shared, result),
            _ = shutdown_rx.recv() => return Err(EngineError::ShuttingDown),
        }
    }
}

/// Flips a fully present file to seeding unless a chunk landing already did.
async fn complete(shared: &Arc<Shared>, file_hash: &str) -> Result<FileRecord, EngineError> {
    match shared.catalog.transition(file_hash, FileState::Seeding).await {
        Ok(record) => {
            shared.finish_download(&record);
            Ok(record)
        }
        Err(CatalogError::InvalidTransition {
            from: FileState::Seeding,
            ..
        }) => Ok(shared
            .catalog
            .get(file_hash)
            .ok_or_else(|| CatalogError::NotFound(file_hash.to_string()))?),
        Err(e) => Err(e.into()),
    }
}
