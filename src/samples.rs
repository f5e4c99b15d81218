/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Sparse suffix-array samples: a marker bit-vector over BWT positions plus
//! the sample values in position order.
//!
//! On disk a sample file (`.saes`) is a sequence of fixed-width records,
//! position then value, each 5 bytes little-endian, with no framing.

use anyhow::{ensure, Context, Result};
use mmap_rs::MmapFlags;
use std::io::Write;
use std::path::Path;

use crate::bits::{SparseBitVec, SparseBitVecBuilder};
use crate::utils::MmapHelper;

/// Width of one position or value on disk.
pub const SAMPLE_BYTES: usize = 5;
/// Largest storable sample value (and position).
pub const MAX_SAMPLE_VALUE: u64 = (1 << (8 * SAMPLE_BYTES as u64)) - 1;

/// The sample store: after construction, the rank of a marked position is
/// its index into the value array.
pub struct SaSamples {
    markers: SparseBitVec,
    values: Vec<u64>,
}

impl core::fmt::Debug for SaSamples {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SaSamples")
            .field("samples", &self.values.len())
            .finish()
    }
}

impl SaSamples {
    /// Builds the store from `(position, value)` pairs, in any order.
    /// Duplicate pairs are coalesced; two different values for the same
    /// position are an input-shape error.
    pub fn from_pairs(mut pairs: Vec<(u64, u64)>) -> Result<Self> {
        pairs.sort_unstable();
        pairs.dedup();
        for w in pairs.windows(2) {
            ensure!(
                w[0].0 != w[1].0,
                "Conflicting sample values {} and {} at position {}",
                w[0].1,
                w[1].1,
                w[0].0
            );
        }
        let len = pairs.last().map(|&(pos, _)| pos as usize + 1).unwrap_or(0);
        let mut markers = SparseBitVecBuilder::new(len, pairs.len());
        let mut values = Vec::with_capacity(pairs.len());
        for &(pos, value) in &pairs {
            markers.set(pos as usize);
            values.push(value);
        }
        Ok(SaSamples {
            markers: markers.build(),
            values,
        })
    }

    /// Reads and coalesces a `.saes` file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mmap = MmapHelper::<u8>::mmap(path, MmapFlags::SEQUENTIAL)
            .with_context(|| format!("Could not map sample file {}", path.display()))?;
        let bytes = mmap.as_bytes();
        ensure!(
            bytes.len() % (2 * SAMPLE_BYTES) == 0,
            "Truncated sample file {} ({} bytes)",
            path.display(),
            bytes.len()
        );
        let mut pairs = Vec::with_capacity(bytes.len() / (2 * SAMPLE_BYTES));
        for record in bytes.chunks_exact(2 * SAMPLE_BYTES) {
            pairs.push((
                read_u40(&record[..SAMPLE_BYTES]),
                read_u40(&record[SAMPLE_BYTES..]),
            ));
        }
        Self::from_pairs(pairs)
            .with_context(|| format!("Inconsistent sample file {}", path.display()))
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The sample at BWT position `pos`, if one is stored.
    #[inline]
    pub fn get(&self, pos: usize) -> Option<u64> {
        if pos >= self.markers.len() || !self.markers.contains(pos) {
            return None;
        }
        Some(self.values[self.markers.rank(pos)])
    }

    /// Iterates over `(position, value)` pairs in position order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(|(i, &v)| (self.markers.select(i), v))
    }
}

#[inline]
fn read_u40(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..SAMPLE_BYTES].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// Appends one `(position, value)` record to a sample file.
pub fn write_sample(out: &mut impl Write, position: u64, value: u64) -> Result<()> {
    debug_assert!(position <= MAX_SAMPLE_VALUE && value <= MAX_SAMPLE_VALUE);
    out.write_all(&position.to_le_bytes()[..SAMPLE_BYTES])?;
    out.write_all(&value.to_le_bytes()[..SAMPLE_BYTES])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufWriter;

    #[test]
    fn test_from_pairs() -> Result<()> {
        let samples = SaSamples::from_pairs(vec![(7, 3), (0, 10), (2, 5)])?;
        assert_eq!(samples.len(), 3);
        assert_eq!(samples.get(0), Some(10));
        assert_eq!(samples.get(2), Some(5));
        assert_eq!(samples.get(7), Some(3));
        assert_eq!(samples.get(1), None);
        assert_eq!(samples.get(8), None);
        assert_eq!(samples.get(100), None);
        Ok(())
    }

    #[test]
    fn test_duplicates_coalesce() -> Result<()> {
        let samples = SaSamples::from_pairs(vec![(3, 4), (3, 4), (1, 2)])?;
        assert_eq!(samples.len(), 2);
        assert_eq!(samples.get(3), Some(4));
        Ok(())
    }

    #[test]
    fn test_conflicting_values_rejected() {
        assert!(SaSamples::from_pairs(vec![(3, 4), (3, 5)]).is_err());
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("samples.saes");
        {
            let mut out = BufWriter::new(std::fs::File::create(&path)?);
            write_sample(&mut out, 0, 12)?;
            write_sample(&mut out, 5, 7)?;
            write_sample(&mut out, 1 << 33, 1 << 34)?;
            out.flush()?;
        }
        let samples = SaSamples::read(&path)?;
        assert_eq!(samples.len(), 3);
        assert_eq!(samples.get(0), Some(12));
        assert_eq!(samples.get(5), Some(7));
        assert_eq!(samples.get(1 << 33), Some(1 << 34));
        let pairs: Vec<_> = samples.iter().collect();
        assert_eq!(pairs, vec![(0, 12), (5, 7), (1 << 33, 1 << 34)]);
        Ok(())
    }

    #[test]
    fn test_truncated_file_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("samples.saes");
        std::fs::write(&path, [0u8; 7])?;
        assert!(SaSamples::read(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_empty_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("samples.saes");
        std::fs::write(&path, [])?;
        let samples = SaSamples::read(&path)?;
        assert!(samples.is_empty());
        assert_eq!(samples.get(0), None);
        Ok(())
    }
}
