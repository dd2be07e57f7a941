//! Tessera Core Library
//!
//! Core primitives for the Tessera content distribution engine.
//! This crate provides:
//! - Content-addressed block keys (Blake3)
//! - Reed-Solomon parity coding over block groups
//! - Convergent encryption (AES-256-GCM) and zstd compression
//! - Content-tree metadata (Group / Index / Seed)
//! - Common error handling and cooperative cancellation

pub mod cancel;
pub mod compress;
pub mod crypto;
pub mod erasure;
pub mod error;
pub mod key;
pub mod tree;

pub use cancel::CancelToken;
pub use erasure::ParityCoder;
pub use error::{Result, TesseraError};
pub use key::{HashAlgorithm, Key, DIGEST_SIZE};
pub use tree::{
    Certificate, CompressionAlgorithm, CorrectionAlgorithm, CryptoAlgorithm, Group, Index,
    Metadata, Seed,
};

/// Hard cap on a single block's size; writes above this are rejected.
pub const MAX_BLOCK_SIZE: usize = 32 * 1024 * 1024; // 32 MB

/// Blocks a payload is split into before parity coding.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024; // 1 MB

/// Maximum members per parity group (data + parity combined stays within
/// the GF(2^8) shard limit with room for 1:1 redundancy).
pub const MAX_GROUP_KEYS: usize = 128;
