// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Why a chunk is currently not eligible for scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// A request went out to `peer` at `since`.
    Requested { peer: String, since: Instant },
    /// The owning peer delivered and the bytes are being written.
    Landing,
}

pub type ChunkKey = (String, u64);

#[derive(Debug, Default)]
struct TransferState {
    markers: HashMap<ChunkKey, Marker>,
    loads: HashMap<String, usize>,
}

impl TransferState {
    fn decrement(&mut self, peer: &str) {
        if let Some(load) = self.loads.get_mut(peer) {
            *load = load.saturating_sub(1);
            if *load == 0 {
                self.loads.remove(peer);
            }
        }
    }
}

/// In-flight markers and per-peer outstanding request counts. Both live
/// under one lock so a dispatch checks and sets them together.
#[derive(Debug, Default)]
pub struct TransferTracker {
    state: Mutex<TransferState>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims the chunk for `peer`. Fails if the chunk already has a marker
    /// or the peer is at `max_per_peer`.
    pub fn try_mark(&self, file_hash: &str, index: u64, peer: &str, max_per_peer: usize) -> bool {
        let mut state = self.lock();
        let key = (file_hash.to_string(), index);
        if state.markers.contains_key(&key) {
            return false;
        }
        let load = state.loads.get(peer).copied().unwrap_or(0);
        if load >= max_per_peer {
            return false;
        }

        state.markers.insert(
            key,
            Marker::Requested {
                peer: peer.to_string(),
                since: Instant::now(),
            },
        );
        state.loads.insert(peer.to_string(), load + 1);
        true
    }

    /// A delivery arrived from `peer`. If `peer` owns the request its count
    /// drops and the marker becomes `Landing`. Deliveries from anyone else
    /// leave the tracker untouched.
    pub fn begin_landing(&self, file_hash: &str, index: u64, peer: &str) -> bool {
        let mut state = self.lock();
        let key = (file_hash.to_string(), index);
        let owned = matches!(
            state.markers.get(&key),
            Some(Marker::Requested { peer: owner, .. }) if owner == peer
        );
        if owned {
            state.markers.insert(key, Marker::Landing);
            state.decrement(peer);
        }
        owned
    }

    /// Clears a `Landing` marker once the chunk is written or abandoned.
    pub fn finish_landing(&self, file_hash: &str, index: u64) {
        let mut state = self.lock();
        let key = (file_hash.to_string(), index);
        if state.markers.get(&key) == Some(&Marker::Landing) {
            state.markers.remove(&key);
        }
    }

    /// Drops an outstanding request, e.g. when it could not be sent.
    pub fn release(&self, file_hash: &str, index: u64) -> bool {
        let mut state = self.lock();
        let key = (file_hash.to_string(), index);
        match state.markers.get(&key) {
            Some(Marker::Requested { peer, .. }) => {
                let peer = peer.clone();
                state.markers.remove(&key);
                state.decrement(&peer);
                true
            }
            _ => false,
        }
    }

    /// Releases every request for `file_hash` older than `timeout` and
    /// returns the chunk indices put back in the pool.
    pub fn expire(&self, file_hash: &str, timeout: Duration) -> Vec<u64> {
        let mut state = self.lock();
        let expired: Vec<(u64, String)> = state
            .markers
            .iter()
            .filter_map(|((hash, index), marker)| match marker {
                Marker::Requested { peer, since }
                    if hash == file_hash && since.elapsed() >= timeout =>
                {
                    Some((*index, peer.clone()))
                }
                _ => None,
            })
            .collect();

        for (index, peer) in &expired {
            state.markers.remove(&(file_hash.to_string(), *index));
            state.decrement(peer);
        }
        expired.into_iter().map(|(index, _)| index).collect()
    }

    /// Releases everything outstanding to `peer`.
    pub fn release_peer(&self, peer: &str) -> Vec<ChunkKey> {
        let mut state = self.lock();
        let released: Vec<ChunkKey> = state
            .markers
            .iter()
            .filter(|(_, marker)| {
                matches!(marker, Marker::Requested { peer: owner, .. } if owner == peer)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &released {
            state.markers.remove(key);
        }
        state.loads.remove(peer);
        released
    }

    /// Drops every marker for a file that is no longer downloading.
    pub fn clear_file(&self, file_hash: &str) {
        let mut state = self.lock();
        let owners: Vec<String> = state
            .markers
            .iter()
            .filter_map(|((hash, _), marker)| match marker {
                Marker::Requested { peer, .. } if hash == file_hash => Some(peer.clone()),
                _ => None,
            })
            .collect();
        state.markers.retain(|(hash, _), _| hash != file_hash);
        for peer in owners {
            state.decrement(&peer);
        }
    }

    pub fn load(&self, peer: &str) -> usize {
        self.lock().loads.get(peer).copied().unwrap_or(0)
    }

    /// The peer with the fewest outstanding requests that is still under
    /// `max_per_peer`.
    pub fn least_loaded<'a>(&self, peers: &'a [String], max_per_peer: usize) -> Option<&'a String> {
        let state = self.lock();
        peers
            .iter()
            .map(|peer| (peer, state.loads.get(peer).copied().unwrap_or(0)))
            .filter(|(_, load)| *load < max_per_peer)
            .min_by_key(|(_, load)| *load)
            .map(|(peer, _)| peer)
    }

    pub fn oldest_request_age(&self, peer: &str) -> Option<Duration> {
        self.lock()
            .markers
            .values()
            .filter_map(|marker| match marker {
                Marker::Requested { peer: owner, since } if owner == peer => Some(since.elapsed()),
                _ => None,
            })
            .max()
    }

    pub fn marker(&self, file_hash: &str, index: u64) -> Option<Marker> {
        self.lock()
            .markers
            .get(&(file_hash.to_string(), index))
            .cloned()
    }

    pub fn in_flight_count(&self, file_hash: &str) -> usize {
        self.lock()
            .markers
            .keys()
            .filter(|(hash, _)| hash == file_hash)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mark_is_exclusive() {
        let tracker = TransferTracker::new();
        assert!(tracker.try_mark("f", 0, "p1", 8));
        assert!(!tracker.try_mark("f", 0, "p1", 8));
        assert!(!tracker.try_mark("f", 0, "p2", 8));
        assert!(tracker.try_mark("f", 1, "p2", 8));
        assert!(tracker.try_mark("g", 0, "p2", 8));
        assert_eq!(tracker.load("p1"), 1);
        assert_eq!(tracker.load("p2"), 2);
    }

    #[test]
    fn test_mark_respects_per_peer_limit() {
        let tracker = TransferTracker::new();
        assert!(tracker.try_mark("f", 0, "p", 2));
        assert!(tracker.try_mark("f", 1, "p", 2));
        assert!(!tracker.try_mark("f", 2, "p", 2));

        let peers = vec!["p".to_string(), "q".to_string()];
        assert_eq!(tracker.least_loaded(&peers, 2), Some(&peers[1]));
        assert!(tracker.try_mark("f", 2, "q", 2));
        assert!(tracker.try_mark("f", 3, "q", 2));
        assert_eq!(tracker.least_loaded(&peers, 2), None);
    }

    #[test]
    fn test_concurrent_marks_claim_each_chunk_once() {
        let tracker = Arc::new(TransferTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    let peer = format!("peer-{}", worker);
                    (0..64u64)
                        .filter(|&index| tracker.try_mark("f", index, &peer, usize::MAX))
                        .count()
                })
            })
            .collect();

        let claimed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(claimed, 64);
        assert_eq!(tracker.in_flight_count("f"), 64);
    }

    #[test]
    fn test_landing_lifecycle() {
        let tracker = TransferTracker::new();
        tracker.try_mark("f", 0, "p", 8);

        assert!(tracker.begin_landing("f", 0, "p"));
        assert_eq!(tracker.load("p"), 0);
        assert_eq!(tracker.marker("f", 0), Some(Marker::Landing));
        assert!(!tracker.try_mark("f", 0, "q", 8));

        // A second delivery from the same peer is no longer owned.
        assert!(!tracker.begin_landing("f", 0, "p"));
        assert_eq!(tracker.load("p"), 0);

        tracker.finish_landing("f", 0);
        assert_eq!(tracker.marker("f", 0), None);
        assert!(tracker.try_mark("f", 0, "q", 8));
    }

    #[test]
    fn test_non_owner_delivery_leaves_owner_alone() {
        let tracker = TransferTracker::new();
        tracker.try_mark("f", 0, "owner", 8);

        assert!(!tracker.begin_landing("f", 0, "late"));
        assert_eq!(tracker.load("owner"), 1);
        assert!(matches!(
            tracker.marker("f", 0),
            Some(Marker::Requested { peer, .. }) if peer == "owner"
        ));

        tracker.finish_landing("f", 0);
        assert!(tracker.marker("f", 0).is_some());
    }

    #[test]
    fn test_counter_never_goes_negative() {
        let tracker = TransferTracker::new();
        tracker.try_mark("f", 0, "p", 8);
        assert!(tracker.release("f", 0));
        assert!(!tracker.release("f", 0));
        assert!(!tracker.begin_landing("f", 0, "p"));
        assert_eq!(tracker.release_peer("p"), Vec::<ChunkKey>::new());
        assert_eq!(tracker.load("p"), 0);

        tracker.try_mark("f", 1, "p", 8);
        tracker.release_peer("p");
        assert!(!tracker.begin_landing("f", 1, "p"));
        assert_eq!(tracker.load("p"), 0);
    }

    #[test]
    fn test_expire_releases_old_requests() {
        let tracker = TransferTracker::new();
        tracker.try_mark("f", 0, "p", 8);
        tracker.try_mark("g", 0, "p", 8);

        assert!(tracker.expire("f", Duration::from_secs(60)).is_empty());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(tracker.expire("f", Duration::from_millis(10)), vec![0]);
        assert_eq!(tracker.marker("f", 0), None);
        assert_eq!(tracker.load("p"), 1);
        assert!(tracker.marker("g", 0).is_some());
    }

    #[test]
    fn test_release_peer_and_oldest_age() {
        let tracker = TransferTracker::new();
        tracker.try_mark("f", 0, "p", 8);
        tracker.try_mark("f", 1, "p", 8);
        tracker.try_mark("f", 2, "q", 8);
        tracker.begin_landing("f", 1, "p");

        assert!(tracker.oldest_request_age("p").is_some());
        assert!(tracker.oldest_request_age("nobody").is_none());

        let released = tracker.release_peer("p");
        assert_eq!(released, vec![("f".to_string(), 0)]);
        assert_eq!(tracker.load("p"), 0);
        assert_eq!(tracker.marker("f", 1), Some(Marker::Landing));
        assert_eq!(tracker.load("q"), 1);
    }

    #[test]
    fn test_clear_file() {
        let tracker = TransferTracker::new();
        tracker.try_mark("f", 0, "p", 8);
        tracker.try_mark("g", 0, "p", 8);
        tracker.clear_file("f");
        assert_eq!(tracker.in_flight_count("f"), 0);
        assert_eq!(tracker.load("p"), 1);
    }
}
