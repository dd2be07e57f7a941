//! Tessera Pipelines
//!
//! Upload and download state machines over the block store:
//! - `UploadManager` turns files and shares into published descriptors
//! - `DownloadManager` turns descriptors back into files on disk
//! - `PeerTransport` is the fire-and-forget view of the wire layer
//! - `PresenceTracker` counts locally present group members

pub mod config;
pub mod download;
pub mod item;
pub mod peer;
pub mod presence;
pub mod upload;

pub use config::{ConfigError, EngineConfig, PipelineSettings, StoreSettings};
pub use download::DownloadManager;
pub use item::{DownloadItem, DownloadProgress, DownloadState, UploadItem, UploadProgress, UploadState};
pub use peer::{LoopbackPeer, PeerTransport};
pub use presence::{GroupHandle, GroupPresence, PresenceTracker};
pub use upload::UploadManager;
