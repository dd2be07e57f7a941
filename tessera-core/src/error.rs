//! Error types for Tessera
//!
//! Provides a unified error type for all Tessera operations.

use thiserror::Error;

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Unified error type for Tessera
#[derive(Error, Debug)]
pub enum TesseraError {
    // ===== Block Store Errors =====
    /// The block is not present, its sectors are unreadable, or its bytes no
    /// longer match the key's digest. The offending entry has been removed.
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    /// Write-time rejection: the payload does not hash to the key, or exceeds
    /// the maximum block size. The store is unchanged.
    #[error("Bad block: {0}")]
    BadBlock(String),

    /// Capacity exhausted even after eviction; the write was rejected.
    #[error("Space not found: need {needed} sectors, {available} free")]
    SpaceNotFound { needed: usize, available: usize },

    /// A share is already registered for this path.
    #[error("Share conflict: {0}")]
    ShareConflict(String),

    /// Unlock of a key with no outstanding pins.
    #[error("Key not locked: {0}")]
    KeyNotLocked(String),

    // ===== Erasure Coding Errors =====
    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("Insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("Shard size mismatch: expected {expected}, got {actual}")]
    ShardSizeMismatch { expected: usize, actual: usize },

    // ===== Cryptography Errors =====
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    // ===== Codec Errors =====
    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decoded output exceeds declared length: limit {limit} bytes")]
    OutputTooLarge { limit: u64 },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // ===== Control Flow =====
    /// Cooperative cancellation; distinguished from genuine failure so the
    /// pipelines can re-queue instead of erroring the item.
    #[error("Operation cancelled")]
    Cancelled,

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// True for the benign stop/cancel case, false for genuine failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TesseraError::Cancelled)
    }
}

impl From<reed_solomon_erasure::Error> for TesseraError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        match err {
            reed_solomon_erasure::Error::TooFewShardsPresent => {
                TesseraError::InsufficientShards {
                    available: 0,
                    required: 0,
                }
            }
            other => TesseraError::ErasureCoding(other.to_string()),
        }
    }
}

impl From<bincode::Error> for TesseraError {
    fn from(err: bincode::Error) -> Self {
        TesseraError::Serialization(err.to_string())
    }
}
