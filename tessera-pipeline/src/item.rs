//! Pipeline item records
//!
//! One mutable record per content item, owned by its pipeline manager and
//! persisted across restarts. Runtime-only bookkeeping (cancel tokens,
//! tracker handles) is rebuilt on load.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use tessera_core::{CompressionAlgorithm, CryptoAlgorithm, Group, Index, Key, Seed};

use crate::presence::GroupHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    ComputeHash,
    Encoding,
    ParityEncoding,
    Uploading,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadState {
    Downloading,
    Decoding,
    ParityDecoding,
    Completed,
    Error,
}

/// Per-item record of an upload in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadItem {
    pub id: u64,
    pub name: String,
    pub source: PathBuf,
    /// Share mode indexes the source in place instead of copying it in.
    pub share: bool,
    pub priority: u8,
    pub state: UploadState,
    pub block_length: usize,
    pub compression: CompressionAlgorithm,
    pub crypto: CryptoAlgorithm,
    pub length: u64,
    /// Index levels built so far; the seed carries the final value.
    pub depth: u32,

    /// How the blocks behind `keys` were encoded (flows into the next
    /// Index, or into the seed metadata at the end).
    pub current_compression: CompressionAlgorithm,
    pub current_crypto: CryptoAlgorithm,
    pub current_crypto_key: Option<[u8; 32]>,

    /// Keys awaiting grouping at the current depth.
    pub keys: Vec<Key>,
    /// Groups awaiting Index serialization at the current depth.
    pub groups: Vec<Group>,
    /// Keys published to peers but not yet confirmed uploaded.
    pub upload_keys: BTreeSet<Key>,
    /// Pins this item holds, one entry per lock call.
    pub locked_keys: Vec<Key>,
    /// Data keys retained for the store's descriptor registration.
    pub retain_keys: Vec<Key>,

    pub seed: Option<Seed>,
    pub error: Option<String>,
}

impl UploadItem {
    /// True while the encode worker still has work to do on this item.
    pub fn needs_encoding(&self) -> bool {
        matches!(
            self.state,
            UploadState::ComputeHash | UploadState::Encoding | UploadState::ParityEncoding
        )
    }
}

/// Per-item record of a download in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadItem {
    pub id: u64,
    pub seed: Seed,
    pub destination: PathBuf,
    pub priority: u8,
    pub state: DownloadState,
    /// Decodes left before the payload is reached. Never increases.
    pub remaining_depth: u32,
    /// Index of the level currently being fetched; None while the root key
    /// itself is outstanding.
    pub index: Option<Index>,
    /// Pins this item holds, one entry per lock call.
    pub locked_keys: Vec<Key>,
    /// Every key this item has read, for the post-failure validation sweep.
    pub touched_keys: Vec<Key>,
    /// Completed decode passes, for progress reporting.
    pub decode_count: u32,
    pub error: Option<String>,

    /// Presence tracker registrations for the current level.
    #[serde(skip, default)]
    pub handles: Vec<GroupHandle>,
}

impl DownloadItem {
    pub fn new(id: u64, seed: Seed, destination: PathBuf, priority: u8) -> Self {
        let remaining_depth = seed.metadata.depth;
        Self {
            id,
            seed,
            destination,
            priority,
            state: DownloadState::Downloading,
            remaining_depth,
            index: None,
            locked_keys: Vec::new(),
            touched_keys: Vec::new(),
            decode_count: 0,
            error: None,
            handles: Vec::new(),
        }
    }
}

/// Read-only progress snapshot of an upload item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadProgress {
    pub id: u64,
    pub name: String,
    pub length: u64,
    pub priority: u8,
    pub state: UploadState,
    pub depth: u32,
    pub pending_blocks: usize,
    pub error: Option<String>,
}

impl From<&UploadItem> for UploadProgress {
    fn from(item: &UploadItem) -> Self {
        Self {
            id: item.id,
            name: item.name.clone(),
            length: item.length,
            priority: item.priority,
            state: item.state,
            depth: item.depth,
            pending_blocks: item.upload_keys.len(),
            error: item.error.clone(),
        }
    }
}

/// Read-only progress snapshot of a download item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub id: u64,
    pub name: String,
    pub length: u64,
    pub priority: u8,
    pub state: DownloadState,
    pub remaining_depth: u32,
    pub decode_count: u32,
    pub error: Option<String>,
}

impl From<&DownloadItem> for DownloadProgress {
    fn from(item: &DownloadItem) -> Self {
        Self {
            id: item.id,
            name: item.seed.name.clone(),
            length: item.seed.length,
            priority: item.priority,
            state: item.state,
            remaining_depth: item.remaining_depth,
            decode_count: item.decode_count,
            error: item.error.clone(),
        }
    }
}
