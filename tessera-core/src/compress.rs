//! Content compression
//!
//! zstd with a smallest-wins selection helper: compression is only worth
//! recording in the tree metadata when it actually shrinks the data.

use crate::error::{Result, TesseraError};
use crate::tree::CompressionAlgorithm;

const ZSTD_LEVEL: i32 = 3;

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::encode_all(data, ZSTD_LEVEL)
        .map_err(|e| TesseraError::Compression(e.to_string()))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(data).map_err(|e| TesseraError::Compression(e.to_string()))
}

/// Compress with every candidate algorithm and keep the smallest result.
/// Ties go to `None` so incompressible data skips a decode step later.
pub fn choose_compression(data: &[u8]) -> Result<(CompressionAlgorithm, Vec<u8>)> {
    let compressed = compress(data)?;
    if compressed.len() < data.len() {
        Ok((CompressionAlgorithm::Zstd, compressed))
    } else {
        Ok((CompressionAlgorithm::None, data.to_vec()))
    }
}

/// Apply the recorded algorithm in reverse.
pub fn apply_decompression(algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => decompress(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_roundtrip() {
        let data = b"hello hello hello hello hello hello".repeat(100);
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_choose_compression_picks_zstd_for_redundant_data() {
        let data = vec![0u8; 4096];
        let (algorithm, out) = choose_compression(&data).unwrap();
        assert_eq!(algorithm, CompressionAlgorithm::Zstd);
        assert!(out.len() < data.len());
        assert_eq!(apply_decompression(algorithm, &out).unwrap(), data);
    }

    #[test]
    fn test_choose_compression_skips_incompressible_data() {
        // Random bytes do not compress; zstd output would be larger.
        let data: Vec<u8> = (0..4096).map(|_| rand::random()).collect();
        let (algorithm, out) = choose_compression(&data).unwrap();
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(out, data);
    }
}
