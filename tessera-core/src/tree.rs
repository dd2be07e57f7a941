//! Content-tree metadata types
//!
//! A payload becomes an ordered list of block keys; keys are batched into
//! `Group`s (data keys + parity keys), groups into an `Index` (one tree
//! level), and the serialized index is re-encoded as content one level
//! higher until a single root key remains. The `Seed` is the user-facing
//! handle to the whole tree.

use crate::error::Result;
use crate::key::Key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Compression applied before encryption at one tree level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Zstd,
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::None
    }
}

/// Encryption applied at one tree level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CryptoAlgorithm {
    None,
    Aes256Gcm,
}

impl Default for CryptoAlgorithm {
    fn default() -> Self {
        CryptoAlgorithm::None
    }
}

/// Forward error correction applied to a group of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorrectionAlgorithm {
    None,
    ReedSolomon,
}

impl Default for CorrectionAlgorithm {
    fn default() -> Self {
        CorrectionAlgorithm::None
    }
}

/// A redundancy batch of keys: `information_length` data keys followed by
/// parity keys. Reconstructable from any `information_length`-sized subset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Group {
    pub correction: CorrectionAlgorithm,
    /// Number of data keys at the front of `keys`.
    pub information_length: usize,
    /// Every member is zero-padded to this length for parity math.
    pub block_length: usize,
    /// True byte length of the data portion (unpadded).
    pub total_length: u64,
    pub keys: Vec<Key>,
}

impl Group {
    /// The data-carrying keys (first `information_length`).
    pub fn data_keys(&self) -> &[Key] {
        &self.keys[..self.information_length]
    }

    /// The parity keys (everything after the data keys).
    pub fn parity_keys(&self) -> &[Key] {
        &self.keys[self.information_length..]
    }

    /// Maximum member losses the group tolerates.
    pub fn max_erasures(&self) -> usize {
        self.keys.len() - self.information_length
    }
}

/// One tree level: the groups plus the compression/encryption metadata
/// needed to decode the content their data keys carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Index {
    pub groups: Vec<Group>,
    pub compression: CompressionAlgorithm,
    pub crypto: CryptoAlgorithm,
    pub crypto_key: Option<[u8; 32]>,
}

impl Index {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// All keys of all groups, data and parity.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.groups.iter().flat_map(|g| g.keys.iter())
    }
}

/// Root metadata: where the tree starts and how to decode the root level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    /// Number of index levels between the root key and the payload blocks.
    /// Depth 1 means the root key addresses the payload directly.
    pub depth: u32,
    pub key: Key,
    pub compression: CompressionAlgorithm,
    pub crypto: CryptoAlgorithm,
    pub crypto_key: Option<[u8; 32]>,
}

/// Detached signature over a seed; verification is external.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Certificate {
    pub signer: String,
    pub signature: Vec<u8>,
}

/// User-facing handle to a complete content item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Seed {
    pub name: String,
    pub length: u64,
    pub creation_time: DateTime<Utc>,
    pub metadata: Metadata,
    pub certificate: Option<Certificate>,
}

impl Seed {
    pub fn new(name: impl Into<String>, length: u64, metadata: Metadata) -> Self {
        Self {
            name: name.into(),
            length,
            creation_time: Utc::now(),
            metadata,
            certificate: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::HashAlgorithm;

    fn key(i: u8) -> Key {
        Key::from_data(HashAlgorithm::Blake3, &[i])
    }

    fn sample_group() -> Group {
        Group {
            correction: CorrectionAlgorithm::ReedSolomon,
            information_length: 3,
            block_length: 64,
            total_length: 170,
            keys: (0..5).map(key).collect(),
        }
    }

    #[test]
    fn test_group_key_partitions() {
        let group = sample_group();
        assert_eq!(group.data_keys().len(), 3);
        assert_eq!(group.parity_keys().len(), 2);
        assert_eq!(group.max_erasures(), 2);
        assert_eq!(group.data_keys()[0], key(0));
        assert_eq!(group.parity_keys()[0], key(3));
    }

    #[test]
    fn test_index_roundtrip() {
        let index = Index {
            groups: vec![sample_group()],
            compression: CompressionAlgorithm::Zstd,
            crypto: CryptoAlgorithm::Aes256Gcm,
            crypto_key: Some([9u8; 32]),
        };

        let bytes = index.to_bytes().unwrap();
        let decoded = Index::from_bytes(&bytes).unwrap();
        assert_eq!(index, decoded);
        assert_eq!(decoded.keys().count(), 5);
    }

    #[test]
    fn test_seed_roundtrip() {
        let seed = Seed::new(
            "report.pdf",
            1234,
            Metadata {
                depth: 2,
                key: key(42),
                compression: CompressionAlgorithm::Zstd,
                crypto: CryptoAlgorithm::Aes256Gcm,
                crypto_key: Some([1u8; 32]),
            },
        );

        let bytes = seed.to_bytes().unwrap();
        let decoded = Seed::from_bytes(&bytes).unwrap();
        assert_eq!(seed, decoded);
    }
}
