//! Content and parity codec over the block store
//!
//! Composes compression, encryption and fixed-size splitting on the encode
//! side and the inverse on decode. Parity operations batch keys into
//! `Group`s through the Reed-Solomon coder, writing parity and
//! reconstructed blocks back through the store. All newly written blocks
//! are pinned so callers can reference them before committing a descriptor.

use tracing::debug;

use tessera_core::{
    compress, crypto, CancelToken, CompressionAlgorithm, CorrectionAlgorithm, CryptoAlgorithm,
    Group, Key, ParityCoder, Result, TesseraError, MAX_GROUP_KEYS,
};

use crate::store::BlockStore;

impl BlockStore {
    /// Compress (when beneficial), encrypt, split into `block_length`
    /// chunks and write each chunk as a pinned block. Returns the chunk
    /// keys in order plus the compression actually applied.
    pub fn encode_content(
        &self,
        data: &[u8],
        compression: CompressionAlgorithm,
        crypto_algorithm: CryptoAlgorithm,
        crypto_key: Option<&[u8; 32]>,
        block_length: usize,
        cancel: &CancelToken,
    ) -> Result<(CompressionAlgorithm, Vec<Key>)> {
        let _guard = self.codec_lock.lock();
        cancel.check()?;

        let (chosen, compressed) = match compression {
            CompressionAlgorithm::None => (CompressionAlgorithm::None, data.to_vec()),
            CompressionAlgorithm::Zstd => compress::choose_compression(data)?,
        };

        let payload = match crypto_algorithm {
            CryptoAlgorithm::None => compressed,
            CryptoAlgorithm::Aes256Gcm => {
                let key = crypto_key.ok_or_else(|| {
                    TesseraError::Encryption("no key provided for AES-256-GCM".into())
                })?;
                crypto::encrypt_to_bytes(key, &compressed)?
            }
        };

        let mut keys = Vec::with_capacity(payload.len().div_ceil(block_length.max(1)));
        for chunk in payload.chunks(block_length) {
            cancel.check()?;
            let key = Key::from_data(Default::default(), chunk);
            self.write(&key, chunk)?;
            self.lock(&key);
            keys.push(key);
        }
        // An empty payload still needs a key to hang the tree on.
        if keys.is_empty() {
            let key = Key::from_data(Default::default(), &payload);
            self.write(&key, &payload)?;
            self.lock(&key);
            keys.push(key);
        }

        debug!(blocks = keys.len(), compression = ?chosen, "content encoded");
        Ok((chosen, keys))
    }

    /// Inverse of `encode_content`: read the blocks in order, decrypt,
    /// decompress. `max_length` guards against runaway output.
    pub fn decode_content(
        &self,
        keys: &[Key],
        compression: CompressionAlgorithm,
        crypto_algorithm: CryptoAlgorithm,
        crypto_key: Option<&[u8; 32]>,
        max_length: Option<u64>,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        let _guard = self.codec_lock.lock();

        let mut payload = Vec::new();
        for key in keys {
            cancel.check()?;
            payload.extend_from_slice(&self.read(key)?);
            if let Some(limit) = max_length {
                // Ciphertext and compressed data only ever shrink from here.
                if payload.len() as u64 > limit + crypto::NONCE_SIZE as u64 + 1024 {
                    return Err(TesseraError::OutputTooLarge { limit });
                }
            }
        }

        let compressed = match crypto_algorithm {
            CryptoAlgorithm::None => payload,
            CryptoAlgorithm::Aes256Gcm => {
                let key = crypto_key.ok_or_else(|| {
                    TesseraError::Decryption("no key provided for AES-256-GCM".into())
                })?;
                crypto::decrypt_from_bytes(key, &payload)?
            }
        };

        let out = compress::apply_decompression(compression, &compressed)?;
        if let Some(limit) = max_length {
            if out.len() as u64 > limit {
                return Err(TesseraError::OutputTooLarge { limit });
            }
        }
        Ok(out)
    }

    /// Build a parity `Group` for up to 128 data keys. Parity blocks are
    /// written and pinned; the data keys' bytes are zero-padded to
    /// `block_length` for the parity math only.
    pub fn parity_encode(
        &self,
        keys: &[Key],
        block_length: usize,
        correction: CorrectionAlgorithm,
        cancel: &CancelToken,
    ) -> Result<Group> {
        let _guard = self.codec_lock.lock();
        cancel.check()?;

        if keys.is_empty() || keys.len() > MAX_GROUP_KEYS {
            return Err(TesseraError::ErasureCoding(format!(
                "group size {} outside 1..={}",
                keys.len(),
                MAX_GROUP_KEYS
            )));
        }

        let mut shards = Vec::with_capacity(keys.len());
        let mut total_length = 0u64;
        for key in keys {
            cancel.check()?;
            let bytes = self.read(key)?;
            if bytes.len() > block_length {
                return Err(TesseraError::ShardSizeMismatch {
                    expected: block_length,
                    actual: bytes.len(),
                });
            }
            total_length += bytes.len() as u64;
            let mut shard = bytes;
            shard.resize(block_length, 0);
            shards.push(shard);
        }

        if correction == CorrectionAlgorithm::None {
            return Ok(Group {
                correction,
                information_length: keys.len(),
                block_length,
                total_length,
                keys: keys.to_vec(),
            });
        }

        let coder = ParityCoder::new(keys.len(), keys.len())?;
        let parity = coder.encode(&shards, cancel)?;

        let mut all_keys = keys.to_vec();
        for shard in &parity {
            cancel.check()?;
            let key = Key::from_data(Default::default(), shard);
            self.write(&key, shard)?;
            self.lock(&key);
            all_keys.push(key);
        }

        debug!(
            data = keys.len(),
            parity = parity.len(),
            "parity group encoded"
        );
        Ok(Group {
            correction,
            information_length: keys.len(),
            block_length,
            total_length,
            keys: all_keys,
        })
    }

    /// Recover the data keys of a group, reconstructing missing members
    /// from parity when enough survive. Reconstructed data blocks are
    /// written back into the store.
    pub fn parity_decode(&self, group: &Group, cancel: &CancelToken) -> Result<Vec<Key>> {
        let _guard = self.codec_lock.lock();
        cancel.check()?;

        if group.correction == CorrectionAlgorithm::None {
            return Ok(group.data_keys().to_vec());
        }

        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(group.keys.len());
        let mut available = 0usize;
        for key in &group.keys {
            cancel.check()?;
            match self.read(key) {
                Ok(bytes) => {
                    if bytes.len() > group.block_length {
                        return Err(TesseraError::ShardSizeMismatch {
                            expected: group.block_length,
                            actual: bytes.len(),
                        });
                    }
                    let mut shard = bytes;
                    shard.resize(group.block_length, 0);
                    shards.push(Some(shard));
                    available += 1;
                }
                Err(TesseraError::BlockNotFound(_)) => shards.push(None),
                Err(e) => return Err(e),
            }
        }

        if available < group.information_length {
            return Err(TesseraError::InsufficientShards {
                available,
                required: group.information_length,
            });
        }

        let missing: Vec<usize> = shards
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect();

        if !missing.is_empty() {
            let coder = ParityCoder::new(
                group.information_length,
                group.keys.len() - group.information_length,
            )?;
            coder.reconstruct(&mut shards, cancel)?;

            // Re-cache reconstructed data members, trimmed to true length.
            for &i in &missing {
                if i >= group.information_length {
                    continue;
                }
                let Some(shard) = &shards[i] else { continue };
                let offset = i as u64 * group.block_length as u64;
                let len = (group.total_length - offset).min(group.block_length as u64) as usize;
                self.write(&group.keys[i], &shard[..len])?;
            }
            debug!(reconstructed = missing.len(), "parity group decoded");
        }

        Ok(group.data_keys().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SECTOR_SIZE;
    use crate::StoreConfig;

    fn test_store(dir: &std::path::Path, sectors: u64) -> BlockStore {
        let config = StoreConfig::new(dir)
            .with_capacity(sectors * SECTOR_SIZE as u64)
            .with_allocation_unit(SECTOR_SIZE as u64);
        BlockStore::new(config).unwrap()
    }

    #[test]
    fn test_content_roundtrip_all_modes() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path(), 64);
        let cancel = CancelToken::new();
        let data: Vec<u8> = (0..200_000).map(|i| (i / 64 % 256) as u8).collect();
        let crypto_key = crypto::derive_content_key(&data);

        for compression in [CompressionAlgorithm::None, CompressionAlgorithm::Zstd] {
            for crypto_algorithm in [CryptoAlgorithm::None, CryptoAlgorithm::Aes256Gcm] {
                let (chosen, keys) = store
                    .encode_content(
                        &data,
                        compression,
                        crypto_algorithm,
                        Some(&crypto_key),
                        64 * 1024,
                        &cancel,
                    )
                    .unwrap();

                let decoded = store
                    .decode_content(
                        &keys,
                        chosen,
                        crypto_algorithm,
                        Some(&crypto_key),
                        Some(data.len() as u64),
                        &cancel,
                    )
                    .unwrap();
                assert_eq!(decoded, data);
            }
        }
    }

    #[test]
    fn test_parity_group_survives_erasures() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path(), 64);
        let cancel = CancelToken::new();

        let data: Vec<u8> = (0..300_000).map(|i| (i % 253) as u8).collect();
        let (_, keys) = store
            .encode_content(
                &data,
                CompressionAlgorithm::None,
                CryptoAlgorithm::None,
                None,
                64 * 1024,
                &cancel,
            )
            .unwrap();
        assert_eq!(keys.len(), 5);

        let group = store
            .parity_encode(&keys, 64 * 1024, CorrectionAlgorithm::ReedSolomon, &cancel)
            .unwrap();
        assert_eq!(group.keys.len(), 10);
        assert_eq!(group.information_length, 5);

        // Erase a data member and a parity member.
        store.remove(&group.keys[2]).unwrap();
        store.remove(&group.keys[7]).unwrap();

        let recovered = store.parity_decode(&group, &cancel).unwrap();
        assert_eq!(recovered, keys);
        // The erased data member is cached again.
        assert!(store.contains(&group.keys[2]));

        let decoded = store
            .decode_content(
                &recovered,
                CompressionAlgorithm::None,
                CryptoAlgorithm::None,
                None,
                None,
                &cancel,
            )
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_parity_decode_with_too_few_members() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path(), 64);
        let cancel = CancelToken::new();

        let data = vec![7u8; 128 * 1024];
        let (_, keys) = store
            .encode_content(
                &data,
                CompressionAlgorithm::None,
                CryptoAlgorithm::None,
                None,
                64 * 1024,
                &cancel,
            )
            .unwrap();
        let group = store
            .parity_encode(&keys, 64 * 1024, CorrectionAlgorithm::ReedSolomon, &cancel)
            .unwrap();

        // 2 data + 2 parity; erasing 3 leaves fewer than information_length.
        for key in &group.keys[..3] {
            store.remove(key).unwrap();
        }
        let err = store.parity_decode(&group, &cancel).unwrap_err();
        assert!(matches!(err, TesseraError::InsufficientShards { .. }));
    }

    #[test]
    fn test_ten_mib_scenario() {
        // 10 MiB at 1 MiB blocks gives 10 data keys; with 2 parity members
        // any 2 losses are recoverable.
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path(), 256);
        let cancel = CancelToken::new();

        let data: Vec<u8> = (0..10 * 1024 * 1024).map(|i| (i % 241) as u8).collect();
        let (_, keys) = store
            .encode_content(
                &data,
                CompressionAlgorithm::None,
                CryptoAlgorithm::None,
                None,
                1024 * 1024,
                &cancel,
            )
            .unwrap();
        assert_eq!(keys.len(), 10);

        let mut group = store
            .parity_encode(&keys, 1024 * 1024, CorrectionAlgorithm::ReedSolomon, &cancel)
            .unwrap();
        // Keep 2 of the parity members for a 12-key group.
        for key in group.keys.drain(12..) {
            store.unlock(&key).unwrap();
            store.remove(&key).unwrap();
        }
        assert_eq!(group.keys.len(), 12);
        assert_eq!(group.information_length, 10);

        store.remove(&group.keys[0]).unwrap();
        store.remove(&group.keys[11]).unwrap();

        let recovered = store.parity_decode(&group, &cancel).unwrap();
        let decoded = store
            .decode_content(
                &recovered,
                CompressionAlgorithm::None,
                CryptoAlgorithm::None,
                None,
                None,
                &cancel,
            )
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_empty_content_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path(), 8);
        let cancel = CancelToken::new();

        let (chosen, keys) = store
            .encode_content(
                &[],
                CompressionAlgorithm::None,
                CryptoAlgorithm::None,
                None,
                64 * 1024,
                &cancel,
            )
            .unwrap();
        assert_eq!(keys.len(), 1);

        let decoded = store
            .decode_content(&keys, chosen, CryptoAlgorithm::None, None, Some(0), &cancel)
            .unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_cancelled_encode_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path(), 8);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = store
            .encode_content(
                &[0u8; 1024],
                CompressionAlgorithm::None,
                CryptoAlgorithm::None,
                None,
                512,
                &cancel,
            )
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
