/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Sparse bit-vectors with rank, select, and gap queries.
//!
//! The positions of the set bits are stored in an Elias–Fano dictionary
//! with a select index and a select-zero index on the high bits, so `select`
//! is constant time and `rank` is a constant-time successor query.

use anyhow::{ensure, Result};
use sux::bits::{BitFieldVec, BitVec};
use sux::dict::{EliasFano, EliasFanoBuilder};
use sux::rank_sel::{SelectAdaptConst, SelectZeroAdaptConst};
use sux::traits::{IndexedSeq, Succ};

/// The Elias–Fano flavor used throughout the crate: select on ones and on
/// zeros over the high bits, so that both select and successor queries are
/// available.
pub type Ef = EliasFano<
    SelectZeroAdaptConst<
        SelectAdaptConst<BitVec<Box<[usize]>>, Box<[usize]>, 12, 4>,
        Box<[usize]>,
        12,
        4,
    >,
    BitFieldVec<usize, Box<[usize]>>,
>;

/// A bit-vector of length `len` with `ones` set bits, stored sparsely.
pub struct SparseBitVec {
    len: usize,
    ones: usize,
    ef: Ef,
}

impl core::fmt::Debug for SparseBitVec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SparseBitVec")
            .field("len", &self.len)
            .field("ones", &self.ones)
            .finish()
    }
}

/// Builder for [`SparseBitVec`]; positions must be pushed in strictly
/// increasing order.
pub struct SparseBitVecBuilder {
    len: usize,
    efb: EliasFanoBuilder,
    pushed: usize,
    last: Option<usize>,
}

impl SparseBitVecBuilder {
    /// Creates a builder for a bit-vector of length `len` with exactly
    /// `ones` set bits.
    pub fn new(len: usize, ones: usize) -> Self {
        Self {
            len,
            efb: EliasFanoBuilder::new(ones, len.max(1)),
            pushed: 0,
            last: None,
        }
    }

    /// Sets the bit at `pos`. Positions must be strictly increasing and
    /// smaller than the vector length.
    pub fn set(&mut self, pos: usize) {
        debug_assert!(pos < self.len);
        debug_assert!(self.last.is_none_or(|last| pos > last));
        self.efb.push(pos);
        self.pushed += 1;
        self.last = Some(pos);
    }

    pub fn build(self) -> SparseBitVec {
        let ef = self.efb.build();
        let ef: Ef = unsafe {
            ef.map_high_bits(|bits| {
                SelectZeroAdaptConst::<_, _, 12, 4>::new(SelectAdaptConst::<_, _, 12, 4>::new(
                    bits,
                ))
            })
        };
        SparseBitVec {
            len: self.len,
            ones: self.pushed,
            ef,
        }
    }
}

impl SparseBitVec {
    /// An empty bit-vector of length zero.
    pub fn empty() -> Self {
        SparseBitVecBuilder::new(0, 0).build()
    }

    /// Builds a bit-vector of length `len` from an iterator of strictly
    /// increasing set-bit positions.
    pub fn from_positions(
        len: usize,
        ones: usize,
        positions: impl IntoIterator<Item = usize>,
    ) -> Result<Self> {
        let mut builder = SparseBitVecBuilder::new(len, ones);
        let mut count = 0;
        let mut last = None;
        for pos in positions {
            ensure!(pos < len, "set-bit position {} out of bounds ({})", pos, len);
            ensure!(
                last.is_none_or(|l| pos > l),
                "set-bit positions must be strictly increasing"
            );
            builder.set(pos);
            last = Some(pos);
            count += 1;
        }
        ensure!(
            count == ones,
            "expected {} set bits, got {}",
            ones,
            count
        );
        Ok(builder.build())
    }

    /// Length of the bit-vector.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits.
    #[inline(always)]
    pub fn count_ones(&self) -> usize {
        self.ones
    }

    /// Whether the bit at `pos` is set.
    #[inline]
    pub fn contains(&self, pos: usize) -> bool {
        debug_assert!(pos < self.len);
        self.ef.succ(pos).is_some_and(|(_, v)| v == pos)
    }

    /// Number of set bits in `[0, i)`; `i` may be equal to the length.
    #[inline]
    pub fn rank(&self, i: usize) -> usize {
        debug_assert!(i <= self.len);
        match self.ef.succ(i) {
            Some((r, _)) => r,
            None => self.ones,
        }
    }

    /// Position of the `i`-th (zero-based) set bit.
    #[inline]
    pub fn select(&self, i: usize) -> usize {
        debug_assert!(i < self.ones);
        self.ef.get(i)
    }

    /// Length of the `i`-th gap, including the leading set bit: the distance
    /// from the previous set bit (or from the start of the vector) to the
    /// `i`-th one.
    #[inline]
    pub fn gap_at(&self, i: usize) -> usize {
        if i == 0 {
            self.select(0) + 1
        } else {
            self.select(i) - self.select(i - 1)
        }
    }
}
