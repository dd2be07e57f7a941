//! Tessera Block Store
//!
//! Fixed-capacity block cache backed by a flat sector file:
//! - `BlockStore` owning sector allocation, integrity checks and eviction
//! - `SectorBitmap` persisted bit-per-sector allocation map
//! - content encode/decode and parity group operations over the store
//! - store mutation events for pipeline bookkeeping

pub mod bitmap;
pub mod codec;
pub mod events;
pub mod state;
pub mod store;

pub use bitmap::SectorBitmap;
pub use events::StoreEvent;
pub use store::{BlockStore, SECTOR_SIZE};

use std::path::PathBuf;

/// Block store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the flat backing file holding block sectors
    pub blocks_path: PathBuf,

    /// Path to the sector bitmap file
    pub bitmap_path: PathBuf,

    /// Path to the persisted index state
    pub state_path: PathBuf,

    /// Cache capacity in bytes (rounded up to the allocation unit)
    pub capacity: u64,

    /// Capacity rounding granularity in bytes
    pub allocation_unit: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            blocks_path: PathBuf::from("./tessera_data/blocks.bin"),
            bitmap_path: PathBuf::from("./tessera_data/sectors.map"),
            state_path: PathBuf::from("./tessera_data/store.state"),
            capacity: 8 * 1024 * 1024 * 1024,   // 8 GB
            allocation_unit: 256 * 1024 * 1024, // 256 MB
        }
    }
}

impl StoreConfig {
    /// Create a config with all files under the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            blocks_path: dir.join("blocks.bin"),
            bitmap_path: dir.join("sectors.map"),
            state_path: dir.join("store.state"),
            ..Default::default()
        }
    }

    /// Set cache capacity
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = bytes;
        self
    }

    /// Set capacity rounding granularity
    pub fn with_allocation_unit(mut self, bytes: u64) -> Self {
        self.allocation_unit = bytes;
        self
    }
}
