//! Reed-Solomon parity coding
//!
//! Shards are encoded and reconstructed segment by segment: Reed-Solomon in
//! GF(2^8) operates independently on each byte position, so fixed-size
//! segments can be processed in parallel and cancellation is checked between
//! them instead of blocking for the whole shard.

use crate::cancel::CancelToken;
use crate::error::{Result, TesseraError};
use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Unit of parallel parity work.
const SEGMENT_SIZE: usize = 64 * 1024;

/// Reed-Solomon encoder/decoder for a fixed shard geometry.
pub struct ParityCoder {
    data_shards: usize,
    parity_shards: usize,
    rs: ReedSolomon,
}

impl ParityCoder {
    /// Create a coder for `data_shards` + `parity_shards` (GF(2^8) caps the
    /// total at 256).
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        let rs = ReedSolomon::new(data_shards, parity_shards)?;
        Ok(Self {
            data_shards,
            parity_shards,
            rs,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Compute parity shards for equal-length data shards.
    pub fn encode(&self, data: &[Vec<u8>], cancel: &CancelToken) -> Result<Vec<Vec<u8>>> {
        if data.len() != self.data_shards {
            return Err(TesseraError::ErasureCoding(format!(
                "expected {} data shards, got {}",
                self.data_shards,
                data.len()
            )));
        }

        let shard_len = data[0].len();
        if shard_len == 0 {
            return Err(TesseraError::ErasureCoding("empty shards".into()));
        }
        for shard in data {
            if shard.len() != shard_len {
                return Err(TesseraError::ShardSizeMismatch {
                    expected: shard_len,
                    actual: shard.len(),
                });
            }
        }

        let starts: Vec<usize> = (0..shard_len).step_by(SEGMENT_SIZE).collect();

        let segments: Vec<(usize, Vec<Vec<u8>>)> = starts
            .into_par_iter()
            .map(|start| {
                cancel.check()?;
                let end = (start + SEGMENT_SIZE).min(shard_len);
                let views: Vec<&[u8]> = data.iter().map(|d| &d[start..end]).collect();
                let mut parity = vec![vec![0u8; end - start]; self.parity_shards];
                self.rs.encode_sep(&views, &mut parity)?;
                Ok((start, parity))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut parity = vec![vec![0u8; shard_len]; self.parity_shards];
        for (start, segs) in segments {
            for (p, seg) in parity.iter_mut().zip(segs) {
                p[start..start + seg.len()].copy_from_slice(&seg);
            }
        }
        Ok(parity)
    }

    /// Fill in the missing shards of a `data || parity` vector in place.
    /// Requires at least `data_shards` present members.
    pub fn reconstruct(
        &self,
        shards: &mut [Option<Vec<u8>>],
        cancel: &CancelToken,
    ) -> Result<()> {
        if shards.len() != self.total_shards() {
            return Err(TesseraError::ErasureCoding(format!(
                "expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            )));
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_shards {
            return Err(TesseraError::InsufficientShards {
                available,
                required: self.data_shards,
            });
        }

        let shard_len = shards
            .iter()
            .flatten()
            .next()
            .map(|s| s.len())
            .unwrap_or(0);
        if shard_len == 0 {
            return Err(TesseraError::ErasureCoding("empty shards".into()));
        }
        for shard in shards.iter().flatten() {
            if shard.len() != shard_len {
                return Err(TesseraError::ShardSizeMismatch {
                    expected: shard_len,
                    actual: shard.len(),
                });
            }
        }

        let missing: Vec<usize> = shards
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let starts: Vec<usize> = (0..shard_len).step_by(SEGMENT_SIZE).collect();

        let recovered: Vec<(usize, Vec<Vec<u8>>)> = starts
            .into_par_iter()
            .map(|start| {
                cancel.check()?;
                let end = (start + SEGMENT_SIZE).min(shard_len);
                let mut segs: Vec<Option<Vec<u8>>> = shards
                    .iter()
                    .map(|s| s.as_ref().map(|v| v[start..end].to_vec()))
                    .collect();
                self.rs.reconstruct(&mut segs)?;
                let filled = missing
                    .iter()
                    .map(|&i| segs[i].take().ok_or_else(|| {
                        TesseraError::ErasureCoding("reconstruct left a hole".into())
                    }))
                    .collect::<Result<Vec<_>>>()?;
                Ok((start, filled))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut rebuilt = vec![vec![0u8; shard_len]; missing.len()];
        for (start, segs) in recovered {
            for (shard, seg) in rebuilt.iter_mut().zip(segs) {
                shard[start..start + seg.len()].copy_from_slice(&seg);
            }
        }
        for (&i, shard) in missing.iter().zip(rebuilt) {
            shards[i] = Some(shard);
        }
        Ok(())
    }
}
