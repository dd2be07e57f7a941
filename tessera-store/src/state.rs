//! Persisted store index
//!
//! The backing file carries no in-band header; everything needed to find a
//! block again lives in this structure. Saved with a temp-file-then-rename
//! so a crash mid-save leaves the previous state intact.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_core::{Key, Result, Seed, TesseraError};

/// Where a cached block's bytes live and when it was last touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub sectors: Vec<u64>,
    pub length: usize,
    pub update_time: DateTime<Utc>,
}

/// An external file indexed as fixed-size blocks without copying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareEntry {
    pub path: PathBuf,
    pub block_length: usize,
    pub file_length: u64,
    /// Key of each slice, mapped to its block index within the file.
    pub indexes: HashMap<Key, usize>,
}

/// Keys a registered descriptor depends on, kept for re-seeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedEntry {
    pub path: Option<PathBuf>,
    pub keys: Vec<Key>,
}

/// Everything that must survive a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    pub size: u64,
    pub clusters: HashMap<Key, ClusterEntry>,
    pub shares: HashMap<PathBuf, ShareEntry>,
    pub seeds: HashMap<Seed, SeedEntry>,
}

impl StoreState {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bincode::serialize(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Total sectors covered by cluster entries.
    pub fn occupied_sectors(&self) -> usize {
        self.clusters.values().map(|c| c.sectors.len()).sum()
    }
}

/// Load state if the file exists, otherwise start empty.
pub fn load_or_default(path: impl AsRef<Path>) -> Result<StoreState> {
    match StoreState::load(&path) {
        Ok(state) => Ok(state),
        Err(TesseraError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(StoreState::default())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::HashAlgorithm;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.state");

        let key = Key::from_data(HashAlgorithm::Blake3, b"block");
        let mut state = StoreState {
            size: 1024,
            ..Default::default()
        };
        state.clusters.insert(
            key,
            ClusterEntry {
                sectors: vec![3, 7],
                length: 500,
                update_time: Utc::now(),
            },
        );

        state.save(&path).unwrap();
        let loaded = StoreState::load(&path).unwrap();
        assert_eq!(loaded.size, 1024);
        assert_eq!(loaded.clusters[&key].sectors, vec![3, 7]);
        assert_eq!(loaded.occupied_sectors(), 2);
    }

    #[test]
    fn test_missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = load_or_default(dir.path().join("absent")).unwrap();
        assert_eq!(state.size, 0);
        assert!(state.clusters.is_empty());
    }
}
