//! Upload pipeline
//!
//! Turns a source file (or an in-place share) into a published content
//! descriptor. A single encode worker repeatedly advances the
//! highest-priority item one step at a time: source intake, parity
//! batching, Index wrapping at the next depth, and finally descriptor
//! registration. A drain worker moves keys from pending to confirmed as
//! peer upload confirmations arrive.
//!
//! Heavy work runs on a clone of the item with the manager lock released;
//! cancellation (stop or item removal) discards the step without touching
//! the stored record.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tessera_core::{
    crypto, CancelToken, CompressionAlgorithm, CorrectionAlgorithm, CryptoAlgorithm, Index, Key,
    Metadata, Result, Seed, TesseraError, MAX_GROUP_KEYS,
};
use tessera_store::BlockStore;

use crate::item::{UploadItem, UploadProgress, UploadState};
use crate::peer::PeerTransport;

struct UploadInner {
    items: HashMap<u64, UploadItem>,
    cancels: HashMap<u64, CancelToken>,
    next_id: u64,
}

/// Manager for all upload items.
pub struct UploadManager {
    store: Arc<BlockStore>,
    peer: Arc<dyn PeerTransport>,
    inner: Arc<Mutex<UploadInner>>,
    confirmations: Mutex<Option<Receiver<Key>>>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    poll_interval: Duration,
}

impl UploadManager {
    pub fn new(
        store: Arc<BlockStore>,
        peer: Arc<dyn PeerTransport>,
        confirmations: Receiver<Key>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            peer,
            inner: Arc::new(Mutex::new(UploadInner {
                items: HashMap::new(),
                cancels: HashMap::new(),
                next_id: 1,
            })),
            confirmations: Mutex::new(Some(confirmations)),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            poll_interval,
        }
    }

    /// Submit a file for upload. Returns the item id.
    pub fn add(
        &self,
        source: impl Into<PathBuf>,
        name: impl Into<String>,
        compression: CompressionAlgorithm,
        crypto_algorithm: CryptoAlgorithm,
        block_length: usize,
        priority: u8,
    ) -> u64 {
        self.add_item(source.into(), name.into(), false, compression, crypto_algorithm, block_length, priority)
    }

    /// Register a file as a share: its slices are indexed in place and only
    /// index levels above the data are compressed/encrypted.
    pub fn add_share(
        &self,
        source: impl Into<PathBuf>,
        name: impl Into<String>,
        compression: CompressionAlgorithm,
        crypto_algorithm: CryptoAlgorithm,
        block_length: usize,
        priority: u8,
    ) -> u64 {
        self.add_item(source.into(), name.into(), true, compression, crypto_algorithm, block_length, priority)
    }

    fn add_item(
        &self,
        source: PathBuf,
        name: String,
        share: bool,
        compression: CompressionAlgorithm,
        crypto_algorithm: CryptoAlgorithm,
        block_length: usize,
        priority: u8,
    ) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.insert(
            id,
            UploadItem {
                id,
                name,
                source,
                share,
                priority,
                state: UploadState::ComputeHash,
                block_length,
                compression,
                crypto: crypto_algorithm,
                length: 0,
                depth: 1,
                current_compression: CompressionAlgorithm::None,
                current_crypto: CryptoAlgorithm::None,
                current_crypto_key: None,
                keys: Vec::new(),
                groups: Vec::new(),
                upload_keys: Default::default(),
                locked_keys: Vec::new(),
                retain_keys: Vec::new(),
                seed: None,
                error: None,
            },
        );
        inner.cancels.insert(id, CancelToken::new());
        debug!(id, "upload item added");
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
        for key in &item.locked_keys {
            let _ = self.store.unlock(key);
        }
        // An unfinished share registration belongs to this item alone.
        if item.share && item.state != UploadState::Completed {
            let _ = self.store.remove_share(&item.source);
        }
        debug!(id, "upload item removed");
        Ok(())
    }

    /// Remove and resubmit an item with the same source and priority.
    pub fn reset(&self, id: u64) -> Result<u64> {
        let snapshot = {
            let inner = self.inner.lock();
            inner.items.get(&id).map(|item| {
                (
                    item.source.clone(),
                    item.name.clone(),
                    item.share,
                    item.compression,
                    item.crypto,
                    item.block_length,
                    item.priority,
                )
            })
        };
        let Some((source, name, share, compression, crypto_algorithm, block_length, priority)) =
            snapshot
        else {
            return Err(TesseraError::Internal(format!("no upload item {id}")));
        };
        self.remove(id)?;
        Ok(self.add_item(source, name, share, compression, crypto_algorithm, block_length, priority))
    }

    pub fn set_priority(&self, id: u64, priority: u8) {
        if let Some(item) = self.inner.lock().items.get_mut(&id) {
            item.priority = priority;
        }
    }

    pub fn progress(&self, id: u64) -> Option<UploadProgress> {
        self.inner.lock().items.get(&id).map(UploadProgress::from)
    }

    pub fn list(&self) -> Vec<UploadProgress> {
        self.inner
            .lock()
            .items
            .values()
            .map(UploadProgress::from)
            .collect()
    }

    pub fn seed_of(&self, id: u64) -> Option<Seed> {
        self.inner
            .lock()
            .items
            .get(&id)
            .and_then(|item| item.seed.clone())
    }

    /// Start the encode and confirmation workers.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock();

        {
            let store = Arc::clone(&self.store);
            let peer = Arc::clone(&self.peer);
            let inner = Arc::clone(&self.inner);
            let running = Arc::clone(&self.running);
            let interval = self.poll_interval;
            workers.push(std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    if !encode_step(&store, &peer, &inner) {
                        std::thread::sleep(interval);
                    }
                }
            }));
        }

        if let Some(confirmations) = self.confirmations.lock().take() {
            let inner = Arc::clone(&self.inner);
            let running = Arc::clone(&self.running);
            let interval = self.poll_interval;
            workers.push(std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match confirmations.recv_timeout(interval) {
                        Ok(key) => confirm_uploaded(&inner, &key),
                        Err(_) => {}
                    }
                }
            }));
        }

        info!("upload manager started");
    }

    /// Stop the workers, cancelling in-flight encode work.
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
        // Fresh tokens so a later start() is not pre-cancelled.
        let mut inner = self.inner.lock();
        let ids: Vec<u64> = inner.items.keys().copied().collect();
        for id in ids {
            inner.cancels.insert(id, CancelToken::new());
        }
        info!("upload manager stopped");
    }

    /// Persist all items.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let inner = self.inner.lock();
        let items: Vec<&UploadItem> = inner.items.values().collect();
        let bytes = bincode::serialize(&items).map_err(TesseraError::from)?;
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load items saved by `save`, re-establishing their pins.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = fs::read(path)?;
        let items: Vec<UploadItem> = bincode::deserialize(&bytes).map_err(TesseraError::from)?;
        let mut inner = self.inner.lock();
        for item in items {
            for key in &item.locked_keys {
                self.store.lock(key);
            }
            inner.next_id = inner.next_id.max(item.id + 1);
            inner.cancels.insert(item.id, CancelToken::new());
            inner.items.insert(item.id, item);
        }
        Ok(())
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Advance one item by one state-machine step. Returns false when no item
/// needed work.
fn encode_step(
    store: &Arc<BlockStore>,
    peer: &Arc<dyn PeerTransport>,
    inner: &Arc<Mutex<UploadInner>>,
) -> bool {
    let (mut item, cancel) = {
        let inner = inner.lock();
        let Some(item) = inner
            .items
            .values()
            .filter(|item| item.needs_encoding())
            .max_by_key(|item| (item.priority, std::cmp::Reverse(item.id)))
        else {
            return false;
        };
        let Some(cancel) = inner.cancels.get(&item.id) else {
            return false;
        };
        (item.clone(), cancel.clone())
    };

    let id = item.id;
    let result = process(store, &mut item, &cancel);

    let mut inner = inner.lock();
    if !inner.items.contains_key(&id) {
        return true;
    }
    match result {
        Ok(()) => {
            let publish: Vec<Key> = if item.state == UploadState::Uploading {
                item.upload_keys.iter().copied().collect()
            } else {
                Vec::new()
            };
            inner.items.insert(id, item);
            // State lands before any offer goes out, so confirmations
            // cannot observe the pre-transition item. Offers run without
            // the lock; a slow transport must not stall the manager.
            drop(inner);
            for key in &publish {
                if !peer.is_upload_pending(key) {
                    peer.offer_block(key);
                }
            }
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            warn!(id, error = %e, "upload item failed");
            item.state = UploadState::Error;
            item.error = Some(e.to_string());
            inner.items.insert(id, item);
        }
    }
    true
}

/// One step of the encode state machine, operating on a detached copy.
fn process(store: &BlockStore, item: &mut UploadItem, cancel: &CancelToken) -> Result<()> {
    cancel.check()?;

    if item.keys.is_empty() && item.groups.is_empty() && item.seed.is_none() {
        // Source intake: hash and cache the payload, or index it in place.
        if item.share {
            let keys = store.share(&item.source, item.block_length)?;
            item.length = fs::metadata(&item.source)?.len();
            item.current_compression = CompressionAlgorithm::None;
            item.current_crypto = CryptoAlgorithm::None;
            item.current_crypto_key = None;
            item.keys = keys;
        } else {
            let data = fs::read(&item.source)?;
            item.length = data.len() as u64;
            let content_key = crypto::derive_content_key(&data);
            let (chosen, keys) = store.encode_content(
                &data,
                item.compression,
                item.crypto,
                Some(&content_key),
                item.block_length,
                cancel,
            )?;
            item.locked_keys.extend(keys.iter().copied());
            item.current_compression = chosen;
            item.current_crypto = item.crypto;
            item.current_crypto_key =
                (item.crypto != CryptoAlgorithm::None).then_some(content_key);
            item.keys = keys;
        }
        item.state = UploadState::Encoding;
    } else if item.keys.len() == 1 && item.groups.is_empty() {
        // Single key left: build and register the descriptor.
        let root = item.keys[0];
        item.upload_keys.insert(root);
        let seed = Seed::new(
            item.name.clone(),
            item.length,
            Metadata {
                depth: item.depth,
                key: root,
                compression: item.current_compression,
                crypto: item.current_crypto,
                crypto_key: item.current_crypto_key,
            },
        );

        let mut retain = item.retain_keys.clone();
        retain.push(root);
        let source = item.share.then(|| item.source.clone());
        store.set_seed(seed.clone(), source, retain);

        for key in item.locked_keys.drain(..) {
            let _ = store.unlock(&key);
        }
        item.seed = Some(seed);
        item.keys.clear();
        item.state = UploadState::Uploading;
        info!(id = item.id, depth = item.depth, "upload descriptor built");
    } else if !item.keys.is_empty() {
        // Batch pending keys into parity groups.
        let keys = std::mem::take(&mut item.keys);
        for chunk in keys.chunks(MAX_GROUP_KEYS) {
            cancel.check()?;
            let group = store.parity_encode(
                chunk,
                item.block_length,
                CorrectionAlgorithm::ReedSolomon,
                cancel,
            )?;
            item.locked_keys.extend(group.parity_keys().iter().copied());
            item.retain_keys.extend(group.data_keys().iter().copied());
            item.upload_keys.extend(group.keys.iter().copied());
            item.groups.push(group);
        }
        item.state = UploadState::ParityEncoding;
    } else {
        // Wrap accumulated groups into an Index one level up.
        let index = Index {
            groups: std::mem::take(&mut item.groups),
            compression: item.current_compression,
            crypto: item.current_crypto,
            crypto_key: item.current_crypto_key,
        };
        let bytes = index.to_bytes()?;
        let content_key = crypto::derive_content_key(&bytes);
        let (chosen, keys) = store.encode_content(
            &bytes,
            item.compression,
            item.crypto,
            Some(&content_key),
            item.block_length,
            cancel,
        )?;
        item.locked_keys.extend(keys.iter().copied());
        item.current_compression = chosen;
        item.current_crypto = item.crypto;
        item.current_crypto_key = (item.crypto != CryptoAlgorithm::None).then_some(content_key);
        item.keys = keys;
        item.depth += 1;
        item.state = UploadState::Encoding;
        debug!(id = item.id, depth = item.depth, "index level encoded");
    }

    Ok(())
}

fn confirm_uploaded(inner: &Arc<Mutex<UploadInner>>, key: &Key) {
    let mut inner = inner.lock();
    for item in inner.items.values_mut() {
        if item.state != UploadState::Uploading {
            continue;
        }
        if item.upload_keys.remove(key) && item.upload_keys.is_empty() {
            item.state = UploadState::Completed;
            info!(id = item.id, "upload completed");
        }
    }
}
