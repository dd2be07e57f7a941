//! Block cache store
//!
//! A fixed-capacity cache over a flat sector file. Blocks are looked up by
//! Key through a cluster index (cached bytes) or a share index (slices of
//! external files). One coarse lock guards the whole state: the sector
//! frontier, bitmap and cluster index carry cross-field invariants that
//! must move together.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use tessera_core::{CancelToken, Key, Result, Seed, TesseraError, MAX_BLOCK_SIZE};

use crate::bitmap::SectorBitmap;
use crate::events::StoreEvent;
use crate::state::{load_or_default, ClusterEntry, SeedEntry, ShareEntry, StoreState};
use crate::StoreConfig;

/// Fixed sector size of the backing file.
pub const SECTOR_SIZE: usize = 256 * 1024;

pub(crate) struct StoreInner {
    config: StoreConfig,
    file: File,
    bitmap: SectorBitmap,
    /// Capacity in bytes, always a multiple of the allocation unit.
    size: u64,
    clusters: HashMap<Key, ClusterEntry>,
    shares: HashMap<PathBuf, ShareEntry>,
    share_index: HashMap<Key, Vec<PathBuf>>,
    seeds: HashMap<Seed, SeedEntry>,
    locks: HashMap<Key, usize>,
    /// Known-free sectors, lowest first.
    frontier: BTreeSet<u64>,
    /// Next sector the bitmap scan will visit.
    scan_pos: u64,
    /// False until occupancy has been rebuilt into the bitmap.
    scanned: bool,
    subscribers: Vec<Sender<StoreEvent>>,
}

/// Monitor-style block store; every public operation holds the inner lock
/// for its duration.
pub struct BlockStore {
    pub(crate) inner: Mutex<StoreInner>,
    /// Serializes the heavyweight encode/decode/parity operations.
    pub(crate) codec_lock: Mutex<()>,
}

fn round_up(value: u64, unit: u64) -> u64 {
    value.div_ceil(unit) * unit
}

impl BlockStore {
    /// Open the store, loading persisted index state if present.
    pub fn new(config: StoreConfig) -> Result<Self> {
        for path in [&config.blocks_path, &config.bitmap_path, &config.state_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.blocks_path)?;

        let state = load_or_default(&config.state_path)?;
        let size = if state.size > 0 {
            state.size
        } else {
            round_up(config.capacity, config.allocation_unit)
        };
        file.set_len(size)?;

        let bitmap = SectorBitmap::open(&config.bitmap_path, size / SECTOR_SIZE as u64)?;

        let mut share_index: HashMap<Key, Vec<PathBuf>> = HashMap::new();
        for (path, share) in &state.shares {
            for key in share.indexes.keys() {
                share_index.entry(*key).or_default().push(path.clone());
            }
        }

        let mut inner = StoreInner {
            config,
            file,
            bitmap,
            size,
            clusters: state.clusters,
            shares: state.shares,
            share_index,
            seeds: state.seeds,
            locks: HashMap::new(),
            frontier: BTreeSet::new(),
            scan_pos: 0,
            scanned: false,
            subscribers: Vec::new(),
        };
        inner.check_seeds();

        debug!(
            capacity = inner.size,
            blocks = inner.clusters.len(),
            shares = inner.shares.len(),
            "block store opened"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            codec_lock: Mutex::new(()),
        })
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.inner.lock().size
    }

    /// Number of cached blocks (share-backed keys not counted).
    pub fn block_count(&self) -> usize {
        self.inner.lock().clusters.len()
    }

    pub fn contains(&self, key: &Key) -> bool {
        let inner = self.inner.lock();
        inner.clusters.contains_key(key) || inner.share_index.contains_key(key)
    }

    /// Byte length of a stored block.
    pub fn length_of(&self, key: &Key) -> Result<usize> {
        let inner = self.inner.lock();
        if let Some(entry) = inner.clusters.get(key) {
            return Ok(entry.length);
        }
        if let Some(paths) = inner.share_index.get(key) {
            for path in paths {
                if let Some(share) = inner.shares.get(path) {
                    if let Some(&index) = share.indexes.get(key) {
                        let offset = index as u64 * share.block_length as u64;
                        let len = (share.file_length - offset).min(share.block_length as u64);
                        return Ok(len as usize);
                    }
                }
            }
        }
        Err(TesseraError::BlockNotFound(key.to_string()))
    }

    /// Read and verify a block. A block that fails verification or cannot be
    /// read is removed before the error is returned.
    pub fn read(&self, key: &Key) -> Result<Vec<u8>> {
        self.inner.lock().read(key)
    }

    /// Write a block under its key. No-op if already present.
    pub fn write(&self, key: &Key, value: &[u8]) -> Result<()> {
        self.inner.lock().write(key, value)
    }

    /// Pin a key against eviction. Counts nest.
    pub fn lock(&self, key: &Key) {
        let mut inner = self.inner.lock();
        *inner.locks.entry(*key).or_insert(0) += 1;
    }

    /// Release one pin.
    pub fn unlock(&self, key: &Key) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.locks.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                inner.locks.remove(key);
                Ok(())
            }
            None => Err(TesseraError::KeyNotLocked(key.to_string())),
        }
    }

    /// Drop a cached block, freeing its sectors. Missing keys are ignored.
    pub fn remove(&self, key: &Key) -> Result<()> {
        self.inner.lock().remove_cluster(key)?;
        Ok(())
    }

    /// Change capacity. Rounds up to the allocation unit, drops clusters
    /// that no longer fit, truncates the backing file.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        self.inner.lock().resize(new_size)
    }

    /// Index an external file as fixed-size blocks without copying it.
    /// Returns the slice keys in file order.
    pub fn share(&self, path: impl AsRef<Path>, block_length: usize) -> Result<Vec<Key>> {
        self.inner.lock().share(path.as_ref(), block_length)
    }

    /// Drop a share registration.
    pub fn remove_share(&self, path: impl AsRef<Path>) -> Result<()> {
        self.inner.lock().remove_share(path.as_ref())
    }

    /// Registered share paths.
    pub fn share_paths(&self) -> Vec<PathBuf> {
        self.inner.lock().shares.keys().cloned().collect()
    }

    /// Register a descriptor with the keys it depends on. Referenced keys
    /// are exempt from eviction.
    pub fn set_seed(&self, seed: Seed, path: Option<PathBuf>, keys: Vec<Key>) {
        self.inner.lock().seeds.insert(seed, SeedEntry { path, keys });
    }

    pub fn remove_seed(&self, seed: &Seed) {
        self.inner.lock().seeds.remove(seed);
    }

    pub fn seeds(&self) -> Vec<Seed> {
        self.inner.lock().seeds.keys().cloned().collect()
    }

    /// Persist the index state and flush the bitmap.
    pub fn save(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.bitmap.flush()?;
        inner.file.flush()?;
        let state = StoreState {
            size: inner.size,
            clusters: inner.clusters.clone(),
            shares: inner.shares.clone(),
            seeds: inner.seeds.clone(),
        };
        state.save(&inner.config.state_path)
    }

    /// Subscribe to store mutation events.
    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = unbounded();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    /// Re-read every cached block, purging entries that fail verification.
    /// Returns `(checked, purged)`.
    pub fn verify_blocks(&self, cancel: &CancelToken) -> Result<(usize, usize)> {
        let keys: Vec<Key> = self.inner.lock().clusters.keys().copied().collect();
        let mut purged = 0;
        for key in &keys {
            cancel.check()?;
            if self.read(key).is_err() {
                purged += 1;
            }
        }
        if purged > 0 {
            warn!(checked = keys.len(), purged, "block verification purged entries");
        }
        Ok((keys.len(), purged))
    }
}

impl StoreInner {
    fn total_sectors(&self) -> u64 {
        self.size / SECTOR_SIZE as u64
    }

    fn emit(&mut self, event: StoreEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn read(&mut self, key: &Key) -> Result<Vec<u8>> {
        if let Some(entry) = self.clusters.get(key) {
            let sectors = entry.sectors.clone();
            let length = entry.length;
            match self.read_sectors(&sectors, length) {
                Ok(bytes) if key.verify(&bytes) => {
                    if let Some(entry) = self.clusters.get_mut(key) {
                        entry.update_time = Utc::now();
                    }
                    return Ok(bytes);
                }
                _ => {
                    warn!(%key, "cached block failed verification, removing");
                    self.remove_cluster(key)?;
                    return Err(TesseraError::BlockNotFound(key.to_string()));
                }
            }
        }

        if let Some(paths) = self.share_index.get(key) {
            let path = paths[0].clone();
            if let Some(share) = self.shares.get(&path) {
                if let Some(&index) = share.indexes.get(key) {
                    let offset = index as u64 * share.block_length as u64;
                    let len = (share.file_length - offset).min(share.block_length as u64);
                    match read_file_slice(&path, offset, len as usize) {
                        Ok(bytes) if key.verify(&bytes) => return Ok(bytes),
                        _ => {
                            warn!(%key, path = %path.display(), "shared block unreadable, dropping share");
                            self.remove_share(&path)?;
                            return Err(TesseraError::BlockNotFound(key.to_string()));
                        }
                    }
                }
            }
        }

        Err(TesseraError::BlockNotFound(key.to_string()))
    }

    fn read_sectors(&mut self, sectors: &[u64], length: usize) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; length];
        for (i, &sector) in sectors.iter().enumerate() {
            let start = i * SECTOR_SIZE;
            let end = (start + SECTOR_SIZE).min(length);
            self.file
                .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
            self.file.read_exact(&mut out[start..end])?;
        }
        Ok(out)
    }

    fn write(&mut self, key: &Key, value: &[u8]) -> Result<()> {
        if value.len() > MAX_BLOCK_SIZE {
            return Err(TesseraError::BadBlock(format!(
                "{} bytes exceeds maximum block size",
                value.len()
            )));
        }
        if !key.verify(value) {
            return Err(TesseraError::BadBlock(format!(
                "data does not hash to {key}"
            )));
        }
        if self.clusters.contains_key(key) || self.share_index.contains_key(key) {
            return Ok(());
        }

        let needed = value.len().div_ceil(SECTOR_SIZE);
        self.create_space(needed)?;
        let sectors = self.allocate(needed)?;

        if let Err(e) = self.write_sectors(&sectors, value) {
            // No cluster entry exists yet; the sectors must go back or they
            // stay occupied until the next bitmap rebuild.
            self.release_sectors(&sectors);
            return Err(e.into());
        }

        self.clusters.insert(
            *key,
            ClusterEntry {
                sectors,
                length: value.len(),
                update_time: Utc::now(),
            },
        );
        self.emit(StoreEvent::BlockAdded(*key));
        Ok(())
    }

    fn write_sectors(&mut self, sectors: &[u64], value: &[u8]) -> io::Result<()> {
        for (i, &sector) in sectors.iter().enumerate() {
            let start = i * SECTOR_SIZE;
            let end = (start + SECTOR_SIZE).min(value.len());
            self.file
                .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
            self.file.write_all(&value[start..end])?;
        }
        Ok(())
    }

    /// Return freshly allocated sectors to the free pool. Best effort; the
    /// bitmap catches up on the next rebuild if a bit write fails.
    fn release_sectors(&mut self, sectors: &[u64]) {
        for &sector in sectors {
            let _ = self.bitmap.set(sector, false);
            if sector < self.scan_pos {
                self.frontier.insert(sector);
            }
        }
    }

    /// Rebuild bitmap occupancy from the live cluster index.
    fn ensure_scanned(&mut self) -> Result<()> {
        if self.scanned {
            return Ok(());
        }
        let total = self.total_sectors();
        self.bitmap.set_length(total)?;
        let StoreInner {
            ref clusters,
            ref mut bitmap,
            ..
        } = *self;
        for entry in clusters.values() {
            for &sector in &entry.sectors {
                if sector < total {
                    bitmap.set(sector, true)?;
                }
            }
        }
        self.frontier.clear();
        self.scan_pos = 0;
        self.scanned = true;
        Ok(())
    }

    /// Scan the bitmap forward until the frontier holds `target` free
    /// sectors or the bitmap is exhausted.
    fn refill_frontier(&mut self, target: usize) -> Result<()> {
        let total = self.total_sectors();
        while self.frontier.len() < target && self.scan_pos < total {
            if !self.bitmap.get(self.scan_pos)? {
                self.frontier.insert(self.scan_pos);
            }
            self.scan_pos += 1;
        }
        Ok(())
    }

    /// Make sure at least `needed` sectors are free, evicting the oldest
    /// unlocked and unreferenced clusters if the frontier falls short.
    fn create_space(&mut self, needed: usize) -> Result<()> {
        self.ensure_scanned()?;
        self.refill_frontier(needed)?;
        if self.frontier.len() >= needed {
            return Ok(());
        }

        let referenced: HashSet<Key> = self
            .seeds
            .values()
            .flat_map(|entry| entry.keys.iter().copied())
            .collect();

        let mut candidates: Vec<(DateTime<Utc>, Key, usize)> = self
            .clusters
            .iter()
            .filter(|(key, _)| {
                !self.locks.contains_key(key)
                    && !referenced.contains(key)
                    && !self.share_index.contains_key(key)
            })
            .map(|(key, entry)| (entry.update_time, *key, entry.sectors.len()))
            .collect();
        candidates.sort();

        let achievable = self.frontier.len() + candidates.iter().map(|c| c.2).sum::<usize>();
        if achievable < needed {
            return Err(TesseraError::SpaceNotFound {
                needed,
                available: achievable,
            });
        }

        for (_, key, _) in candidates {
            if self.frontier.len() >= needed {
                break;
            }
            debug!(%key, "evicting block to free space");
            self.remove_cluster(&key)?;
        }
        Ok(())
    }

    /// Take `needed` sectors off the frontier, lowest first.
    fn allocate(&mut self, needed: usize) -> Result<Vec<u64>> {
        let mut sectors = Vec::with_capacity(needed);
        for _ in 0..needed {
            let sector = self
                .frontier
                .pop_first()
                .ok_or(TesseraError::SpaceNotFound {
                    needed,
                    available: sectors.len(),
                })?;
            self.bitmap.set(sector, true)?;
            sectors.push(sector);
        }
        Ok(sectors)
    }

    fn remove_cluster(&mut self, key: &Key) -> Result<bool> {
        let Some(entry) = self.clusters.remove(key) else {
            return Ok(false);
        };
        if self.scanned {
            let total = self.total_sectors();
            for sector in entry.sectors {
                if sector < total {
                    self.bitmap.set(sector, false)?;
                    if sector < self.scan_pos {
                        self.frontier.insert(sector);
                    }
                }
            }
        }
        self.emit(StoreEvent::BlockRemoved(*key));
        Ok(true)
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        let size = round_up(new_size, self.config.allocation_unit);
        let total = size / SECTOR_SIZE as u64;

        let removed: Vec<Key> = self
            .clusters
            .iter()
            .filter(|(_, entry)| entry.sectors.iter().any(|&s| s >= total))
            .map(|(key, _)| *key)
            .collect();
        for key in removed {
            self.clusters.remove(&key);
            self.emit(StoreEvent::BlockRemoved(key));
        }

        self.size = size;
        self.bitmap.set_length(total)?;
        self.file.set_len(size)?;
        self.frontier.clear();
        self.scan_pos = 0;
        self.scanned = false;

        debug!(capacity = size, "store resized");
        Ok(())
    }

    fn share(&mut self, path: &Path, block_length: usize) -> Result<Vec<Key>> {
        if self.shares.contains_key(path) {
            return Err(TesseraError::ShareConflict(path.display().to_string()));
        }

        let mut file = File::open(path)?;
        let file_length = file.metadata()?.len();

        let mut keys = Vec::new();
        let mut indexes = HashMap::new();
        let mut buf = vec![0u8; block_length];
        let mut index = 0usize;
        let mut remaining = file_length;
        while remaining > 0 {
            let len = remaining.min(block_length as u64) as usize;
            file.read_exact(&mut buf[..len])?;
            let key = Key::from_data(Default::default(), &buf[..len]);
            indexes.insert(key, index);
            keys.push(key);
            index += 1;
            remaining -= len as u64;
        }

        for key in indexes.keys() {
            self.share_index
                .entry(*key)
                .or_default()
                .push(path.to_path_buf());
        }
        self.shares.insert(
            path.to_path_buf(),
            ShareEntry {
                path: path.to_path_buf(),
                block_length,
                file_length,
                indexes,
            },
        );

        debug!(path = %path.display(), blocks = keys.len(), "share registered");
        Ok(keys)
    }

    fn remove_share(&mut self, path: &Path) -> Result<()> {
        let Some(share) = self.shares.remove(path) else {
            return Ok(());
        };
        for key in share.indexes.keys() {
            if let Some(paths) = self.share_index.get_mut(key) {
                paths.retain(|p| p != path);
                if paths.is_empty() {
                    self.share_index.remove(key);
                }
            }
        }
        self.emit(StoreEvent::ShareRemoved(path.to_path_buf()));
        Ok(())
    }

    /// Drop descriptors whose keys are no longer resolvable.
    fn check_seeds(&mut self) {
        let clusters = &self.clusters;
        let share_index = &self.share_index;
        self.seeds.retain(|_, entry| {
            entry
                .keys
                .iter()
                .all(|key| clusters.contains_key(key) || share_index.contains_key(key))
        });
    }
}

fn read_file_slice(path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{CompressionAlgorithm, CryptoAlgorithm, HashAlgorithm, Metadata};

    fn small_store(dir: &Path, capacity: u64) -> BlockStore {
        let config = StoreConfig::new(dir)
            .with_capacity(capacity)
            .with_allocation_unit(SECTOR_SIZE as u64);
        BlockStore::new(config).unwrap()
    }

    fn block(fill: u8, len: usize) -> (Key, Vec<u8>) {
        let data = vec![fill; len];
        (Key::from_data(HashAlgorithm::Blake3, &data), data)
    }

    fn seed_for(key: Key) -> Seed {
        Seed::new(
            "pinned",
            0,
            Metadata {
                depth: 1,
                key,
                compression: CompressionAlgorithm::None,
                crypto: CryptoAlgorithm::None,
                crypto_key: None,
            },
        )
    }

    // Timestamps order eviction candidates; keep writes apart.
    fn tick() {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path(), 4 * SECTOR_SIZE as u64);

        let (key, data) = block(0xab, 100_000);
        store.write(&key, &data).unwrap();
        assert!(store.contains(&key));
        assert_eq!(store.length_of(&key).unwrap(), 100_000);
        assert_eq!(store.read(&key).unwrap(), data);
    }

    #[test]
    fn test_bad_block_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path(), 4 * SECTOR_SIZE as u64);

        let (key, _) = block(1, 64);
        let err = store.write(&key, &[2u8; 64]).unwrap_err();
        assert!(matches!(err, TesseraError::BadBlock(_)));
        assert!(!store.contains(&key));
    }

    #[test]
    fn test_unlock_without_lock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path(), 4 * SECTOR_SIZE as u64);

        let (key, data) = block(3, 64);
        store.write(&key, &data).unwrap();
        assert!(matches!(
            store.unlock(&key),
            Err(TesseraError::KeyNotLocked(_))
        ));

        store.lock(&key);
        store.lock(&key);
        store.unlock(&key).unwrap();
        store.unlock(&key).unwrap();
        assert!(matches!(
            store.unlock(&key),
            Err(TesseraError::KeyNotLocked(_))
        ));
    }

    #[test]
    fn test_multi_sector_block() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path(), 8 * SECTOR_SIZE as u64);

        let data: Vec<u8> = (0..SECTOR_SIZE * 2 + 1234).map(|i| (i % 251) as u8).collect();
        let key = Key::from_data(HashAlgorithm::Blake3, &data);
        store.write(&key, &data).unwrap();
        assert_eq!(store.read(&key).unwrap(), data);
    }

    #[test]
    fn test_remove_frees_space() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path(), SECTOR_SIZE as u64);

        let (a, data_a) = block(1, SECTOR_SIZE);
        store.write(&a, &data_a).unwrap();
        store.lock(&a);

        // Store full and pinned; a second write cannot make space.
        let (b, data_b) = block(2, SECTOR_SIZE);
        assert!(matches!(
            store.write(&b, &data_b),
            Err(TesseraError::SpaceNotFound { .. })
        ));

        store.unlock(&a).unwrap();
        store.remove(&a).unwrap();
        store.write(&b, &data_b).unwrap();
        assert!(store.contains(&b));
    }

    #[test]
    fn test_eviction_prefers_oldest_unreferenced() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path(), 2 * SECTOR_SIZE as u64);

        let (a, data_a) = block(1, SECTOR_SIZE);
        let (b, data_b) = block(2, SECTOR_SIZE);
        store.write(&a, &data_a).unwrap();
        tick();
        store.write(&b, &data_b).unwrap();
        tick();
        // Touching the older entry makes the other one the candidate.
        store.read(&a).unwrap();

        let (c, data_c) = block(3, SECTOR_SIZE);
        store.write(&c, &data_c).unwrap();
        assert!(store.contains(&a));
        assert!(!store.contains(&b));
        assert!(store.contains(&c));
    }

    #[test]
    fn test_seed_referenced_keys_exempt_from_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path(), 2 * SECTOR_SIZE as u64);

        let (a, data_a) = block(4, SECTOR_SIZE);
        let (b, data_b) = block(5, SECTOR_SIZE);
        store.write(&a, &data_a).unwrap();
        tick();
        store.write(&b, &data_b).unwrap();
        store.set_seed(seed_for(a), None, vec![a]);

        // `a` is the oldest entry but a descriptor depends on it.
        let (c, data_c) = block(6, SECTOR_SIZE);
        store.write(&c, &data_c).unwrap();
        assert!(store.contains(&a));
        assert!(!store.contains(&b));
        assert!(store.contains(&c));
    }

    #[test]
    fn test_share_linked_keys_exempt_from_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path(), 2 * SECTOR_SIZE as u64);

        let (d, data_d) = block(7, SECTOR_SIZE);
        let (e, data_e) = block(8, SECTOR_SIZE);
        store.write(&d, &data_d).unwrap();
        tick();
        store.write(&e, &data_e).unwrap();

        // A share slice with the same bytes links `d` to an external file.
        let shared = dir.path().join("linked.bin");
        std::fs::write(&shared, &data_d).unwrap();
        store.share(&shared, SECTOR_SIZE).unwrap();

        let (f, data_f) = block(9, SECTOR_SIZE);
        store.write(&f, &data_f).unwrap();
        assert!(!store.contains(&e));
        assert!(store.contains(&f));
        // The cluster copy of `d` survived alongside the share link.
        assert_eq!(store.block_count(), 2);
        assert_eq!(store.read(&d).unwrap(), data_d);
    }

    #[test]
    fn test_space_not_found_leaves_state_intact() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path(), 2 * SECTOR_SIZE as u64);

        let (a, data_a) = block(10, SECTOR_SIZE);
        let (b, data_b) = block(11, SECTOR_SIZE);
        store.write(&a, &data_a).unwrap();
        store.write(&b, &data_b).unwrap();
        store.set_seed(seed_for(a), None, vec![a, b]);

        let (c, data_c) = block(12, SECTOR_SIZE);
        assert!(matches!(
            store.write(&c, &data_c),
            Err(TesseraError::SpaceNotFound { .. })
        ));
        // Nothing was evicted to make room for a write that cannot fit.
        assert_eq!(store.read(&a).unwrap(), data_a);
        assert_eq!(store.read(&b).unwrap(), data_b);
        assert!(!store.contains(&c));
    }

    #[test]
    fn test_resize_drops_out_of_range_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path(), 4 * SECTOR_SIZE as u64);

        let (a, data_a) = block(13, SECTOR_SIZE);
        let (b, data_b) = block(14, SECTOR_SIZE);
        let (c, data_c) = block(15, SECTOR_SIZE);
        store.write(&a, &data_a).unwrap();
        store.write(&b, &data_b).unwrap();
        store.write(&c, &data_c).unwrap();

        // Rounds up to the allocation unit; sector 2 falls out of range.
        store.resize(SECTOR_SIZE as u64 + 1).unwrap();
        assert_eq!(store.capacity(), 2 * SECTOR_SIZE as u64);
        assert!(!store.contains(&c));
        assert_eq!(store.read(&a).unwrap(), data_a);
        assert_eq!(store.read(&b).unwrap(), data_b);
    }

    #[test]
    fn test_released_sectors_are_reusable() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path(), 2 * SECTOR_SIZE as u64);

        {
            let mut inner = store.inner.lock();
            inner.ensure_scanned().unwrap();
            inner.refill_frontier(2).unwrap();
            let sectors = inner.allocate(2).unwrap();
            assert!(inner.frontier.is_empty());
            inner.release_sectors(&sectors);
        }

        // A full-capacity write succeeds, so no sector stayed occupied.
        let (key, data) = block(16, 2 * SECTOR_SIZE);
        store.write(&key, &data).unwrap();
        assert_eq!(store.read(&key).unwrap(), data);
    }

    #[test]
    fn test_verify_blocks_purges_corrupt_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path(), 4 * SECTOR_SIZE as u64);

        let (good, good_data) = block(5, 2000);
        let (bad, bad_data) = block(6, 2000);
        store.write(&good, &good_data).unwrap();
        store.write(&bad, &bad_data).unwrap();
        store.save().unwrap();

        // Flip a byte inside the second block's sector.
        let offset = SECTOR_SIZE as u64 + 100;
        let mut file = OpenOptions::new()
            .write(true)
            .open(dir.path().join("blocks.bin"))
            .unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&[0xff]).unwrap();
        drop(file);

        let cancel = CancelToken::new();
        let (checked, purged) = store.verify_blocks(&cancel).unwrap();
        assert_eq!(checked, 2);
        assert_eq!(purged, 1);
        assert!(store.contains(&good));
        assert!(!store.contains(&bad));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (key, data) = block(9, 1000);
        {
            let store = small_store(dir.path(), 4 * SECTOR_SIZE as u64);
            store.write(&key, &data).unwrap();
            store.save().unwrap();
        }

        let store = small_store(dir.path(), 4 * SECTOR_SIZE as u64);
        assert!(store.contains(&key));
        assert_eq!(store.read(&key).unwrap(), data);
    }
}
