/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The r-index: a run-length encoded BWT, its suffix-array samples, the
//! observed alphabet, and the F array, with LF/FL navigation and the
//! run-boundary sample classification.

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::path::Path;

use crate::alphabet::Alphabet;
use crate::rle::RleString;
use crate::samples::{SaSamples, MAX_SAMPLE_VALUE};
use crate::utils::{
    is_terminator, partition, ALPHABET_MAX_SIZE, DATA_TERMINATOR, STRING_TERMINATOR,
};

/// Name of the RLE BWT file inside an index directory.
pub const BWT_FILE: &str = "bwt.rle";
/// Name of the sample file inside an index directory.
pub const SAMPLES_FILE: &str = "samples.saes";

bitflags::bitflags! {
    /// Classification of a BWT position with respect to its run: the empty
    /// set means the position is strictly inside a run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SampleGenre: u8 {
        /// First position of a run.
        const START = 1;
        /// Last position of a run.
        const END = 2;
    }
}

impl SampleGenre {
    #[inline(always)]
    pub fn is_start(self) -> bool {
        self.contains(SampleGenre::START)
    }

    #[inline(always)]
    pub fn is_end(self) -> bool {
        self.contains(SampleGenre::END)
    }
}

/// An r-index over one collection of sequences.
pub struct RIndex {
    bwt: RleString,
    samples: SaSamples,
    alphabet: Alphabet,
    /// `f[c]` is the number of BWT symbols smaller than `c`; `f[256]` is the
    /// BWT length.
    f: Box<[usize; ALPHABET_MAX_SIZE + 1]>,
    sequences: usize,
}

impl core::fmt::Debug for RIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RIndex")
            .field("size", &self.len())
            .field("runs", &self.runs())
            .field("sequences", &self.sequences)
            .finish()
    }
}

impl RIndex {
    /// Loads an index from a directory holding `bwt.rle`, `bwt.rle.meta`,
    /// and `samples.saes`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let bwt = RleString::load(dir.join(BWT_FILE))
            .with_context(|| format!("Could not load BWT from {}", dir.display()))?;
        let samples = SaSamples::read(dir.join(SAMPLES_FILE))
            .with_context(|| format!("Could not load samples from {}", dir.display()))?;
        Ok(Self::from_parts(bwt, samples))
    }

    /// Binds an in-memory BWT and sample store into an index, deriving the
    /// F array, the alphabet, and the sequence count.
    pub fn from_parts(bwt: RleString, samples: SaSamples) -> Self {
        let mut f = Box::new([0usize; ALPHABET_MAX_SIZE + 1]);
        let mut alphabet = Alphabet::new();
        for c in 0..ALPHABET_MAX_SIZE {
            let count = bwt.char_count(c as u8);
            f[c + 1] = count;
            if count > 0 {
                alphabet.update(c as u8);
            }
        }
        let mut sequences = f[STRING_TERMINATOR as usize + 1];
        if sequences == 0 {
            sequences = f[DATA_TERMINATOR as usize + 1];
        }
        if bwt.len() != 0 && sequences == 0 {
            sequences = 1;
        }
        for c in 1..=ALPHABET_MAX_SIZE {
            f[c] += f[c - 1];
        }
        alphabet.init();

        RIndex {
            bwt,
            samples,
            alphabet,
            f,
            sequences,
        }
    }

    /// BWT length.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bwt.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sequences in the collection.
    #[inline(always)]
    pub fn sequences(&self) -> usize {
        self.sequences
    }

    /// Number of BWT runs.
    #[inline(always)]
    pub fn runs(&self) -> usize {
        self.bwt.number_of_runs()
    }

    /// Number of distinct symbols.
    #[inline(always)]
    pub fn sigma(&self) -> usize {
        self.alphabet.sigma()
    }

    #[inline(always)]
    pub fn bwt(&self) -> &RleString {
        &self.bwt
    }

    #[inline(always)]
    pub fn samples(&self) -> &SaSamples {
        &self.samples
    }

    #[inline(always)]
    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    /// Number of occurrences of `c` in `BWT[0..i)`.
    #[inline(always)]
    pub fn rank(&self, i: usize, c: u8) -> usize {
        self.bwt.rank(i, c)
    }

    /// Position of the `i`-th (zero-based) occurrence of `c`.
    #[inline(always)]
    pub fn select(&self, i: usize, c: u8) -> usize {
        self.bwt.select(i, c)
    }

    /// The symbol of the F column at position `i`.
    pub fn f_at(&self, i: usize) -> u8 {
        debug_assert!(i < self.len());
        (self.f.partition_point(|&x| x <= i) - 1) as u8
    }

    /// Backward step: the position of `BWT[i]` in the F column.
    #[inline]
    pub fn lf(&self, i: usize) -> usize {
        self.lf_c(i, self.bwt.at(i))
    }

    /// Backward step for a known symbol.
    #[inline]
    pub fn lf_c(&self, i: usize, c: u8) -> usize {
        self.f[c as usize] + self.bwt.rank(i, c)
    }

    /// Backward step of an inclusive range, restricted to `c`; `None` if the
    /// restriction is empty.
    pub fn lf_range(&self, range: (usize, usize), c: u8) -> Option<(usize, usize)> {
        // symbol does not occur in the text
        if self.f[c as usize] >= self.f[c as usize + 1] {
            return None;
        }
        let before = self.bwt.rank(range.0, c);
        let inside = self.bwt.rank(range.1 + 1, c) - before;
        if inside == 0 {
            return None;
        }
        let l = self.f[c as usize] + before;
        Some((l, l + inside - 1))
    }

    /// Forward step: the position in the L column of the F-column symbol at
    /// position `i`.
    pub fn fl(&self, i: usize) -> usize {
        let c = self.f_at(i);
        self.bwt.select(i - self.f[c as usize], c)
    }

    /// Forward step for a known F-column symbol.
    pub fn fl_c(&self, i: usize, c: u8) -> usize {
        debug_assert_eq!(c, self.f_at(i));
        self.bwt.select(i - self.f[c as usize], c)
    }

    /// The full BWT range.
    pub fn full_range(&self) -> (usize, usize) {
        (0, self.len() - 1)
    }

    /// The sample genre of position `i`: a position carries a sample iff its
    /// genre is non-empty or it is a sequence start.
    pub fn its(&self, i: usize) -> SampleGenre {
        if i == 0 {
            return SampleGenre::START;
        }
        if i < self.sequences {
            return SampleGenre::all();
        }
        if i == self.len() - 1 {
            return SampleGenre::END;
        }
        let mut genre = SampleGenre::empty();
        if self.bwt.is_run_end(i - 1) {
            genre |= SampleGenre::START;
        }
        if self.bwt.is_run_end(i) {
            genre |= SampleGenre::END;
        }
        genre
    }

    /// Extracts sequence `i` by walking LF from position `i` until a
    /// terminator is read.
    pub fn sequence(&self, i: usize) -> Vec<u8> {
        let mut out = vec![self.bwt.at(i)];
        let mut j = self.lf(i);
        while !is_terminator(self.bwt.at(j)) {
            out.push(self.bwt.at(j));
            j = self.lf(j);
        }
        out.reverse();
        out
    }
}

/// Outcome of [`check_structure`]: positions violating the sample
/// invariants.
#[derive(Debug, Default)]
pub struct CheckReport {
    /// Positions whose genre requires a sample but none is stored.
    pub missing: Vec<usize>,
    /// Positions carrying a sample with empty genre beyond the
    /// sequence-head region.
    pub unnecessary: Vec<usize>,
    /// Positions whose sample value exceeds the storable range.
    pub invalid: Vec<usize>,
}

impl CheckReport {
    /// The check passes iff no sample is missing and none is invalid.
    pub fn passed(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }
}

/// Verifies that samples are present exactly where the run boundaries
/// require them, in parallel over position ranges.
pub fn check_structure(index: &RIndex) -> CheckReport {
    let ranges = partition(index.len(), rayon::current_num_threads().max(1));
    let reports: Vec<CheckReport> = ranges
        .par_iter()
        .map(|range| {
            let mut report = CheckReport::default();
            for i in range.start..range.end {
                let genre = index.its(i);
                match index.samples().get(i) {
                    None if !genre.is_empty() => report.missing.push(i),
                    Some(v) if !genre.is_empty() => {
                        if v >= MAX_SAMPLE_VALUE - 1000 {
                            report.invalid.push(i);
                        }
                    }
                    Some(_) if genre.is_empty() && i > index.sequences() => {
                        report.unnecessary.push(i)
                    }
                    _ => {}
                }
            }
            report
        })
        .collect();

    let mut merged = CheckReport::default();
    for mut report in reports {
        merged.missing.append(&mut report.missing);
        merged.unnecessary.append(&mut report.unnecessary);
        merged.invalid.append(&mut report.invalid);
    }
    merged
}

/// Walks every sequence backwards, decrementing the expected SA value, and
/// counts the positions where a stored sample disagrees.
pub fn check_sa_values(index: &RIndex) -> u64 {
    (0..index.sequences())
        .into_par_iter()
        .map(|seq| {
            let mut errors = 0u64;
            let mut pos = seq;
            let Some(mut sa_value) = index.samples().get(seq) else {
                return 1;
            };
            while !is_terminator(index.bwt().at(pos)) {
                if !index.its(pos).is_empty() && index.samples().get(pos) != Some(sa_value) {
                    errors += 1;
                }
                pos = index.lf(pos);
                sa_value = sa_value.wrapping_sub(1);
            }
            errors
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::SaSamples;

    // BWT of "GATTACAT\x03GATACAT\x03GATTAGATA\x01".
    fn fixture() -> RIndex {
        let bwt = [
            b'A', b'T', b'T', b'T', b'T', b'T', b'T', b'C', b'C', b'G', b'G', b'G', b'G', b'A',
            b'A', b'A', STRING_TERMINATOR, DATA_TERMINATOR, STRING_TERMINATOR, b'A', b'A', b'A',
            b'T', b'A', b'T', b'A', b'A',
        ];
        let sa = [
            26u64, 8, 16, 25, 4, 12, 21, 6, 14, 23, 10, 1, 18, 5, 13, 22, 9, 0, 17, 7, 15, 24, 3,
            11, 20, 2, 19,
        ];
        let rle = RleString::from_bytes(&bwt);
        let mut pairs = vec![(0u64, sa[0])];
        for j in 0..bwt.len() {
            if j + 1 < bwt.len() && bwt[j] != bwt[j + 1] {
                pairs.push((j as u64, sa[j]));
            }
            if j > 0 && bwt[j - 1] != bwt[j] {
                pairs.push((j as u64, sa[j]));
            }
        }
        pairs.push((bwt.len() as u64 - 1, sa[bwt.len() - 1]));
        RIndex::from_parts(rle, SaSamples::from_pairs(pairs).unwrap())
    }

    #[test]
    fn test_counts() {
        let index = fixture();
        assert_eq!(index.len(), 27);
        assert_eq!(index.sequences(), 2);
        assert_eq!(index.sigma(), 6);
    }

    #[test]
    fn test_lf_is_a_bijection() {
        let index = fixture();
        let mut seen = vec![false; index.len()];
        for i in 0..index.len() {
            let j = index.lf(i);
            assert!(j < index.len());
            assert!(!seen[j], "LF({}) = {} already hit", i, j);
            seen[j] = true;
        }
    }

    #[test]
    fn test_fl_inverts_lf() {
        let index = fixture();
        for i in 0..index.len() {
            assert_eq!(index.fl(index.lf(i)), i);
        }
    }

    #[test]
    fn test_genre() {
        let index = fixture();
        assert_eq!(index.its(0), SampleGenre::START);
        assert_eq!(index.its(1), SampleGenre::all());
        // position 2 is inside the T-run
        assert!(index.its(2).is_empty());
        assert_eq!(index.its(index.len() - 1), SampleGenre::END);
        // run boundary T|C at positions 6/7
        assert!(index.its(6).is_end());
        assert!(index.its(7).is_start());
    }

    #[test]
    fn test_structure_check_passes() {
        let index = fixture();
        let report = check_structure(&index);
        assert!(report.passed(), "{:?}", report);
    }
}
