//! Content identifiers
//!
//! Every block is addressed by the hash of its bytes. A `Key` is the hash
//! algorithm tag plus the digest; equality, ordering and hashing all follow
//! the digest bytes.

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Digest width for every supported algorithm.
pub const DIGEST_SIZE: usize = 32;

/// Hash algorithm used for content addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Blake3,
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Blake3
    }
}

/// Content identifier: hash algorithm + digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    algorithm: HashAlgorithm,
    digest: [u8; DIGEST_SIZE],
}

impl Key {
    /// Create a key from an already-computed digest.
    pub fn new(algorithm: HashAlgorithm, digest: [u8; DIGEST_SIZE]) -> Self {
        Self { algorithm, digest }
    }

    /// Compute the key of a byte slice (content-addressing).
    pub fn from_data(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let digest = match algorithm {
            HashAlgorithm::Blake3 => *blake3::hash(data).as_bytes(),
        };
        Self { algorithm, digest }
    }

    /// Hash large data using multiple threads.
    pub fn from_data_parallel(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let digest = match algorithm {
            HashAlgorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                hasher.update_rayon(data);
                *hasher.finalize().as_bytes()
            }
        };
        Self { algorithm, digest }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    /// Verify that `data` hashes to this key.
    pub fn verify(&self, data: &[u8]) -> bool {
        Key::from_data(self.algorithm, data) == *self
    }

    /// Base58 digest string (for logs and display).
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.digest).into_string()
    }

    /// Parse from a base58 digest string.
    pub fn from_base58(algorithm: HashAlgorithm, s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| TesseraError::InvalidKey(e.to_string()))?;

        if bytes.len() != DIGEST_SIZE {
            return Err(TesseraError::InvalidKey(format!(
                "invalid digest length: expected {}, got {}",
                DIGEST_SIZE,
                bytes.len()
            )));
        }

        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&bytes);
        Ok(Self { algorithm, digest })
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.digest
            .cmp(&other.digest)
            .then_with(|| self.algorithm.cmp(&other.algorithm))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", &self.to_base58()[..8])
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}
