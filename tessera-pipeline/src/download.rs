//! Download pipeline
//!
//! Walks a descriptor's content tree back down to bytes on disk. The
//! scheduler prefers items whose current level is already fully
//! satisfiable from local blocks; everything else gets its missing members
//! requested from the peer layer under a per-item budget. Each decode pass
//! consumes one tree level: parity-reconstruct every group, decode the
//! concatenated data keys, and either parse the result as the next Index
//! or materialize the final payload.
//!
//! Store mutation events are drained by a dedicated thread into the
//! presence tracker, so group readiness checks never fan out into
//! per-key store queries.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use tessera_core::{CancelToken, Index, Key, Result, Seed, TesseraError};
use tessera_store::{BlockStore, StoreEvent};

use crate::item::{DownloadItem, DownloadProgress, DownloadState};
use crate::peer::PeerTransport;
use crate::presence::PresenceTracker;

/// Per-tick request budget multiplier; scales with priority cubed.
const REQUEST_BUDGET_BASE: usize = 256;

struct DownloadInner {
    items: HashMap<u64, DownloadItem>,
    cancels: HashMap<u64, CancelToken>,
    next_id: u64,
    /// Round-robin position for the request phase.
    rr_pos: usize,
}

/// Manager for all download items.
pub struct DownloadManager {
    store: Arc<BlockStore>,
    peer: Arc<dyn PeerTransport>,
    tracker: Arc<dyn PresenceTracker>,
    inner: Arc<Mutex<DownloadInner>>,
    events: Mutex<Option<crossbeam::channel::Receiver<StoreEvent>>>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    poll_interval: Duration,
}

impl DownloadManager {
    pub fn new(
        store: Arc<BlockStore>,
        peer: Arc<dyn PeerTransport>,
        tracker: Arc<dyn PresenceTracker>,
        poll_interval: Duration,
    ) -> Self {
        let events = store.subscribe();
        Self {
            store,
            peer,
            tracker,
            inner: Arc::new(Mutex::new(DownloadInner {
                items: HashMap::new(),
                cancels: HashMap::new(),
                next_id: 1,
                rr_pos: 0,
            })),
            events: Mutex::new(Some(events)),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            poll_interval,
        }
    }

    /// Submit a descriptor for download to `destination`.
    pub fn add(&self, seed: Seed, destination: impl Into<PathBuf>, priority: u8) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .items
            .insert(id, DownloadItem::new(id, seed, destination.into(), priority));
        inner.cancels.insert(id, CancelToken::new());
        debug!(id, "download item added");
        id
    }

    /// Remove an item, cancelling in-flight work and releasing its pins.
    pub fn remove(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(cancel) = inner.cancels.remove(&id) {
            cancel.cancel();
        }
        let Some(item) = inner.items.remove(&id) else {
            return Ok(());
        };
        drop(inner);
        for handle in &item.handles {
            self.tracker.unregister(*handle);
        }
        for key in &item.locked_keys {
            let _ = self.store.unlock(key);
        }
        debug!(id, "download item removed");
        Ok(())
    }

    /// Remove and resubmit, preserving descriptor, destination and
    /// priority.
    pub fn reset(&self, id: u64) -> Result<u64> {
        let snapshot = {
            let inner = self.inner.lock();
            inner
                .items
                .get(&id)
                .map(|item| (item.seed.clone(), item.destination.clone(), item.priority))
        };
        let Some((seed, destination, priority)) = snapshot else {
            return Err(TesseraError::Internal(format!("no download item {id}")));
        };
        self.remove(id)?;
        Ok(self.add(seed, destination, priority))
    }

    pub fn set_priority(&self, id: u64, priority: u8) {
        if let Some(item) = self.inner.lock().items.get_mut(&id) {
            item.priority = priority;
        }
    }

    pub fn progress(&self, id: u64) -> Option<DownloadProgress> {
        self.inner.lock().items.get(&id).map(DownloadProgress::from)
    }

    pub fn list(&self) -> Vec<DownloadProgress> {
        self.inner
            .lock()
            .items
            .values()
            .map(DownloadProgress::from)
            .collect()
    }

    /// Start the scheduler/decode worker and the event drain worker.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock();

        {
            let store = Arc::clone(&self.store);
            let peer = Arc::clone(&self.peer);
            let tracker = Arc::clone(&self.tracker);
            let inner = Arc::clone(&self.inner);
            let running = Arc::clone(&self.running);
            let interval = self.poll_interval;
            workers.push(std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    if !schedule_step(&store, &peer, &tracker, &inner) {
                        std::thread::sleep(interval);
                    }
                }
            }));
        }

        if let Some(events) = self.events.lock().take() {
            let tracker = Arc::clone(&self.tracker);
            let running = Arc::clone(&self.running);
            let interval = self.poll_interval;
            workers.push(std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match events.recv_timeout(interval) {
                        Ok(StoreEvent::BlockAdded(key)) => tracker.set_present(&key, true),
                        Ok(StoreEvent::BlockRemoved(key)) => tracker.set_present(&key, false),
                        Ok(StoreEvent::ShareRemoved(_)) | Err(_) => {}
                    }
                }
            }));
        }

        info!("download manager started");
    }

    /// Stop the workers, cancelling in-flight decode work.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let inner = self.inner.lock();
            for cancel in inner.cancels.values() {
                cancel.cancel();
            }
        }
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        let mut inner = self.inner.lock();
        let ids: Vec<u64> = inner.items.keys().copied().collect();
        for id in ids {
            inner.cancels.insert(id, CancelToken::new());
        }
        info!("download manager stopped");
    }

    /// Persist all items.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let inner = self.inner.lock();
        let items: Vec<&DownloadItem> = inner.items.values().collect();
        let bytes = bincode::serialize(&items).map_err(TesseraError::from)?;
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load items saved by `save`, re-establishing pins and presence
    /// registrations.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = fs::read(path)?;
        let items: Vec<DownloadItem> = bincode::deserialize(&bytes).map_err(TesseraError::from)?;
        let mut inner = self.inner.lock();
        for mut item in items {
            for key in &item.locked_keys {
                self.store.lock(key);
            }
            if let Some(index) = &item.index {
                item.handles = register_level(&*self.tracker, &self.store, index);
            }
            inner.next_id = inner.next_id.max(item.id + 1);
            inner.cancels.insert(item.id, CancelToken::new());
            inner.items.insert(item.id, item);
        }
        Ok(())
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Register a level's groups with the tracker and seed their presence from
/// the store.
fn register_level(
    tracker: &dyn PresenceTracker,
    store: &BlockStore,
    index: &Index,
) -> Vec<crate::presence::GroupHandle> {
    let handles: Vec<_> = index.groups.iter().map(|g| tracker.register(g)).collect();
    for group in &index.groups {
        for key in &group.keys {
            tracker.set_present(key, store.contains(key));
        }
    }
    handles
}

/// True when the item's current level can be decoded without any network
/// wait.
fn is_ready(item: &DownloadItem, store: &BlockStore, tracker: &dyn PresenceTracker) -> bool {
    match &item.index {
        None => store.contains(&item.seed.metadata.key),
        Some(index) => index
            .groups
            .iter()
            .zip(&item.handles)
            .all(|(group, &handle)| tracker.count_present(handle) >= group.information_length),
    }
}

/// One scheduler pass: decode a ready item if any, otherwise request
/// missing members for the rest. Returns false when there was nothing to
/// do.
fn schedule_step(
    store: &Arc<BlockStore>,
    peer: &Arc<dyn PeerTransport>,
    tracker: &Arc<dyn PresenceTracker>,
    inner: &Arc<Mutex<DownloadInner>>,
) -> bool {
    // Phase 1: items ready to advance with zero network wait come first.
    let claimed = {
        let mut inner = inner.lock();
        let ready_id = inner
            .items
            .values()
            .filter(|item| {
                item.state == DownloadState::Downloading
                    && item.priority > 0
                    && is_ready(item, store, &**tracker)
            })
            .max_by_key(|item| (item.priority, std::cmp::Reverse(item.id)))
            .map(|item| item.id);

        ready_id.and_then(|id| {
            let cancel = inner.cancels.get(&id)?.clone();
            let item = inner.items.get_mut(&id)?;
            item.state = if item.index.is_some() {
                DownloadState::ParityDecoding
            } else {
                DownloadState::Decoding
            };
            Some((item.clone(), cancel))
        })
    };

    if let Some((mut item, cancel)) = claimed {
        let id = item.id;
        let result = decode_step(store, &**tracker, &mut item, &cancel);

        match result {
            Ok(()) => {
                let mut guard = inner.lock();
                if guard.items.contains_key(&id) {
                    guard.items.insert(id, item);
                }
            }
            Err(e) if e.is_cancelled() => {
                // Benign stop: silently re-queue.
                let mut guard = inner.lock();
                if let Some(original) = guard.items.get_mut(&id) {
                    original.state = DownloadState::Downloading;
                }
            }
            Err(e) => {
                warn!(id, error = %e, "download item failed");
                // Surface corrupt cached blocks now rather than on retry.
                for key in &item.touched_keys {
                    let _ = store.read(key);
                }
                item.state = DownloadState::Error;
                item.error = Some(e.to_string());
                let mut guard = inner.lock();
                if guard.items.contains_key(&id) {
                    guard.items.insert(id, item);
                }
            }
        }
        return true;
    }

    // Phase 2: round-robin the waiting items and fan out block requests.
    request_missing(store, peer, tracker, inner);
    false
}

fn request_missing(
    store: &Arc<BlockStore>,
    peer: &Arc<dyn PeerTransport>,
    tracker: &Arc<dyn PresenceTracker>,
    inner: &Arc<Mutex<DownloadInner>>,
) {
    let (waiting, rr_pos) = {
        let mut inner = inner.lock();
        let mut ids: Vec<(u8, u64)> = inner
            .items
            .values()
            .filter(|item| item.state == DownloadState::Downloading && item.priority > 0)
            .map(|item| (item.priority, item.id))
            .collect();
        ids.sort_by_key(|&(priority, id)| (std::cmp::Reverse(priority), id));
        let pos = if ids.is_empty() {
            0
        } else {
            inner.rr_pos % ids.len()
        };
        inner.rr_pos = inner.rr_pos.wrapping_add(1);
        (ids, pos)
    };

    let mut rng = rand::thread_rng();
    for &(priority, id) in waiting.iter().cycle().skip(rr_pos).take(waiting.len()) {
        let snapshot = {
            let inner = inner.lock();
            inner.items.get(&id).map(|item| {
                (
                    item.seed.metadata.key,
                    item.index.is_some(),
                    item.handles.clone(),
                    item.index
                        .as_ref()
                        .map(|index| {
                            index
                                .groups
                                .iter()
                                .map(|g| g.information_length)
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default(),
                )
            })
        };
        let Some((root_key, has_index, handles, info_lens)) = snapshot else {
            continue;
        };

        if !has_index {
            if !store.contains(&root_key) && !peer.is_download_pending(&root_key) {
                peer.request_block(&root_key);
            }
            continue;
        }

        let budget = REQUEST_BUDGET_BASE * (priority as usize).pow(3);
        let mut in_flight = 0usize;
        let mut wanted: Vec<Key> = Vec::new();
        for (&handle, &info_len) in handles.iter().zip(&info_lens) {
            if tracker.count_present(handle) >= info_len {
                continue;
            }
            for key in tracker.members(handle, false) {
                if peer.is_download_pending(&key) {
                    in_flight += 1;
                } else {
                    wanted.push(key);
                }
            }
        }
        // In-flight requests consume the budget first; the rest go out in
        // random order.
        wanted.shuffle(&mut rng);
        for key in wanted.into_iter().take(budget.saturating_sub(in_flight)) {
            peer.request_block(&key);
        }
    }
}

/// Consume one tree level for the item.
fn decode_step(
    store: &BlockStore,
    tracker: &dyn PresenceTracker,
    item: &mut DownloadItem,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;

    let (keys, compression, crypto_algorithm, crypto_key) = match item.index.take() {
        None => {
            let metadata = &item.seed.metadata;
            (
                vec![metadata.key],
                metadata.compression,
                metadata.crypto,
                metadata.crypto_key,
            )
        }
        Some(index) => {
            let mut keys = Vec::new();
            for group in &index.groups {
                cancel.check()?;
                keys.extend(store.parity_decode(group, cancel)?);
            }
            (keys, index.compression, index.crypto, index.crypto_key)
        }
    };
    item.touched_keys.extend(keys.iter().copied());

    let limit = (item.remaining_depth == 1).then_some(item.seed.length);
    let bytes = store.decode_content(
        &keys,
        compression,
        crypto_algorithm,
        crypto_key.as_ref(),
        limit,
        cancel,
    )?;
    item.decode_count += 1;

    if item.remaining_depth > 1 {
        let index = Index::from_bytes(&bytes)?;
        for &handle in &item.handles {
            tracker.unregister(handle);
        }
        item.handles = register_level(tracker, store, &index);
        for key in index.keys() {
            store.lock(key);
            item.locked_keys.push(*key);
        }
        item.index = Some(index);
        item.remaining_depth -= 1;
        item.state = DownloadState::Downloading;
        debug!(id = item.id, remaining = item.remaining_depth, "index level decoded");
    } else {
        if bytes.len() as u64 != item.seed.length {
            return Err(TesseraError::Internal(format!(
                "decoded {} bytes, descriptor declares {}",
                bytes.len(),
                item.seed.length
            )));
        }
        let final_path = materialize(&item.destination, &item.seed.name, &bytes)?;
        store.set_seed(item.seed.clone(), Some(final_path), keys);
        for &handle in &item.handles {
            tracker.unregister(handle);
        }
        item.handles.clear();
        for key in item.locked_keys.drain(..) {
            let _ = store.unlock(&key);
        }
        item.state = DownloadState::Completed;
        info!(id = item.id, "download completed");
    }

    Ok(())
}

/// Write the payload under a temporary name, then rename into a unique
/// final path.
fn materialize(destination: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = destination.with_file_name(format!("{name}.tmp"));
    fs::write(&tmp, bytes)?;
    let final_path = unique_path(destination);
    fs::rename(&tmp, &final_path)?;
    Ok(final_path)
}

fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    for i in 1.. {
        let candidate = path.with_file_name(format!("{stem} ({i}){extension}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    path.to_path_buf()
}
