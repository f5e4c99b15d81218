/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The run-length encoded BWT container: random access, rank and select by
//! symbol, run ranges and iteration, plus the small caches used by the
//! merge loops.
//!
//! The structure follows the classic r-index layout: a sparse bit-vector
//! marking the last position of every block of runs, one sparse bit-vector
//! per symbol marking the last position of each of its runs (in the
//! symbol's own occurrence space), and the sequence of run heads with
//! access/rank/select by symbol.

use anyhow::{ensure, Result};
use std::path::Path;

use super::{RlDecoder, Run};
use crate::bits::{SparseBitVec, SparseBitVecBuilder};
use crate::utils::{ALPHABET_MAX_SIZE, DATA_TERMINATOR, IMPL_TERMINATOR};

/// Run heads with access, rank, and select by symbol.
///
/// For a byte alphabet a plain byte vector plus per-symbol occurrence lists
/// provides the full wavelet-tree capability surface.
struct RunHeads {
    heads: Vec<u8>,
    occ: Vec<Vec<usize>>,
}

impl RunHeads {
    fn with_capacity(runs: usize) -> Self {
        RunHeads {
            heads: Vec::with_capacity(runs),
            occ: vec![Vec::new(); ALPHABET_MAX_SIZE],
        }
    }

    fn push(&mut self, c: u8) {
        self.occ[c as usize].push(self.heads.len());
        self.heads.push(c);
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.heads.len()
    }

    #[inline(always)]
    fn at(&self, i: usize) -> u8 {
        self.heads[i]
    }

    /// Number of runs headed by `c` among the first `i` runs.
    #[inline]
    fn rank(&self, i: usize, c: u8) -> usize {
        self.occ[c as usize].partition_point(|&x| x < i)
    }

    /// Index of the `i`-th (zero-based) run headed by `c`.
    #[inline]
    fn select(&self, i: usize, c: u8) -> usize {
        self.occ[c as usize][i]
    }
}

/// A run-length encoded string over bytes with rank/select support.
pub struct RleString {
    /// String length.
    n: usize,
    /// Number of runs.
    r: usize,
    /// The `runs` bit-vector marks the last position of every
    /// `block_size`-th run.
    block_size: usize,
    runs: SparseBitVec,
    /// For each symbol, the last position of each of its runs, within the
    /// subsequence of its occurrences.
    runs_per_letter: Vec<SparseBitVec>,
    run_heads: RunHeads,
}

impl core::fmt::Debug for RleString {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RleString")
            .field("n", &self.n)
            .field("r", &self.r)
            .finish()
    }
}

impl RleString {
    /// Loads a segment file (and its metadata sidecar) into the queryable
    /// container.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut decoder = RlDecoder::new(path)?;
        let meta = decoder.metadata().clone();
        let n = meta.size as usize;
        let r = meta.runs as usize;

        let mut runs = Vec::with_capacity(r);
        let mut size_seen = [0u64; ALPHABET_MAX_SIZE];
        let mut runs_seen = [0u64; ALPHABET_MAX_SIZE];
        while let Some(run) = decoder.next_run()? {
            size_seen[run.symbol as usize] += run.len as u64;
            runs_seen[run.symbol as usize] += 1;
            runs.push(run);
        }
        decoder.check_totals()?;
        for c in 0..ALPHABET_MAX_SIZE {
            ensure!(
                size_seen[c] == meta.size_per_char[c] && runs_seen[c] == meta.runs_per_char[c],
                "Segment {}: per-symbol tallies for {:#04x} do not match the metadata",
                path.display(),
                c
            );
        }

        let mut runs_builder = SparseBitVecBuilder::new(n, r);
        let mut per_letter: Vec<SparseBitVecBuilder> = (0..ALPHABET_MAX_SIZE)
            .map(|c| {
                SparseBitVecBuilder::new(
                    meta.size_per_char[c] as usize,
                    meta.runs_per_char[c] as usize,
                )
            })
            .collect();
        let mut per_letter_pos = [0usize; ALPHABET_MAX_SIZE];
        let mut run_heads = RunHeads::with_capacity(r);

        for run in &runs {
            let c = run.symbol as usize;
            run_heads.push(run.symbol);
            runs_builder.set(run.end());
            per_letter[c].set(per_letter_pos[c] + run.len - 1);
            per_letter_pos[c] += run.len;
        }

        Ok(RleString {
            n,
            r,
            block_size: 1,
            runs: runs_builder.build(),
            runs_per_letter: per_letter.into_iter().map(|b| b.build()).collect(),
            run_heads,
        })
    }

    /// Builds the container from a byte string held in memory. Any `0x00`
    /// byte is replaced by [`DATA_TERMINATOR`], as the encoder would.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut runs: Vec<(u8, usize)> = Vec::new();
        for &c in data {
            let c = if c == IMPL_TERMINATOR { DATA_TERMINATOR } else { c };
            match runs.last_mut() {
                Some((last, len)) if *last == c => *len += 1,
                _ => runs.push((c, 1)),
            }
        }
        let n = data.len();
        let r = runs.len();

        let mut size_per_char = [0usize; ALPHABET_MAX_SIZE];
        let mut runs_per_char = [0usize; ALPHABET_MAX_SIZE];
        for &(c, len) in &runs {
            size_per_char[c as usize] += len;
            runs_per_char[c as usize] += 1;
        }

        let mut runs_builder = SparseBitVecBuilder::new(n, r);
        let mut per_letter: Vec<SparseBitVecBuilder> = (0..ALPHABET_MAX_SIZE)
            .map(|c| SparseBitVecBuilder::new(size_per_char[c], runs_per_char[c]))
            .collect();
        let mut per_letter_pos = [0usize; ALPHABET_MAX_SIZE];
        let mut run_heads = RunHeads::with_capacity(r);

        let mut pos = 0;
        for &(c, len) in &runs {
            run_heads.push(c);
            runs_builder.set(pos + len - 1);
            per_letter[c as usize].set(per_letter_pos[c as usize] + len - 1);
            per_letter_pos[c as usize] += len;
            pos += len;
        }

        RleString {
            n,
            r,
            block_size: 1,
            runs: runs_builder.build(),
            runs_per_letter: per_letter.into_iter().map(|b| b.build()).collect(),
            run_heads,
        }
    }

    /// String length.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.n
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Number of runs.
    #[inline(always)]
    pub fn number_of_runs(&self) -> usize {
        self.r
    }

    /// Total occurrences of symbol `c`.
    #[inline(always)]
    pub fn char_count(&self, c: u8) -> usize {
        self.runs_per_letter[c as usize].len()
    }

    /// Whether position `i` is the last position of a run.
    #[inline(always)]
    pub fn is_run_end(&self, i: usize) -> bool {
        self.runs.contains(i)
    }

    /// The symbol at position `i`.
    pub fn at(&self, i: usize) -> u8 {
        self.run_heads.at(self.run_of(i).0)
    }

    /// Number of occurrences of `c` in `[0, i)`.
    pub fn rank(&self, i: usize, c: u8) -> usize {
        assert!(i <= self.n);
        let per_letter = &self.runs_per_letter[c as usize];
        // symbol does not occur
        if per_letter.len() == 0 {
            return 0;
        }
        if i == self.n {
            return per_letter.len();
        }

        let last_block = self.runs.rank(i);
        let mut current_run = last_block * self.block_size;
        // current position in the string: the start of a block
        let mut pos = if last_block > 0 {
            self.runs.select(last_block - 1) + 1
        } else {
            0
        };
        debug_assert!(pos <= i);
        let mut dist = i - pos;

        // scan at most block_size runs
        while pos < i {
            pos += self.run_at(current_run);
            current_run += 1;
            if pos <= i {
                dist = i - pos;
            }
        }
        if pos > i {
            current_run -= 1;
        }
        // position i is inside current_run
        debug_assert!(current_run < self.r);

        // c-runs before the current run
        let rk = self.run_heads.rank(current_run, c);
        // c's before i inside the current run
        let tail = if self.run_heads.at(current_run) == c {
            dist
        } else {
            0
        };
        if rk == 0 {
            return tail;
        }
        per_letter.select(rk - 1) + 1 + tail
    }

    /// Position of the `i`-th (zero-based) occurrence of `c`.
    pub fn select(&self, i: usize, c: u8) -> usize {
        let per_letter = &self.runs_per_letter[c as usize];
        debug_assert!(i < per_letter.len());

        // the i-th c is inside the j-th c-run
        let j = per_letter.rank(i);
        // offset of the i-th c inside its run
        let before = if j == 0 {
            i
        } else {
            i - (per_letter.select(j - 1) + 1)
        };
        // position in run_heads
        let r = self.run_heads.select(j, c);

        // start of the block containing run r, then add the remaining run
        // lengths
        let mut k = if r / self.block_size == 0 {
            0
        } else {
            self.runs.select(r / self.block_size - 1) + 1
        };
        for t in (r / self.block_size) * self.block_size..r {
            k += self.run_at(t);
        }
        k + before
    }

    /// Length of the `j`-th run.
    pub fn run_at(&self, j: usize) -> usize {
        debug_assert!(j < self.r);
        let c = self.run_heads.at(j);
        self.runs_per_letter[c as usize].gap_at(self.run_heads.rank(j, c))
    }

    /// Index of the run containing position `i`.
    pub fn run_of_position(&self, i: usize) -> usize {
        self.run_of(i).0
    }

    /// Inclusive position range of the `j`-th run.
    pub fn run_range(&self, j: usize) -> (usize, usize) {
        debug_assert!(j < self.r);
        let this_block = j / self.block_size;
        let mut current_run = this_block * self.block_size;
        let mut pos = if this_block == 0 {
            0
        } else {
            self.runs.select(this_block - 1) + 1
        };
        while current_run < j {
            pos += self.run_at(current_run);
            current_run += 1;
        }
        (pos, pos + self.run_at(j) - 1)
    }

    /// The `j`-th run.
    pub fn run(&self, j: usize) -> Run {
        let (start, end) = self.run_range(j);
        Run {
            offset: start,
            len: end - start + 1,
            symbol: self.run_heads.at(j),
        }
    }

    /// Breaks a range whose endpoints both hold `c` into the maximal
    /// sub-ranges lying each inside a single `c`-run.
    pub fn break_range(&self, range: (usize, usize), c: u8) -> Vec<(usize, usize)> {
        let (l, r) = range;
        debug_assert!(l <= r && r < self.n);
        debug_assert!(self.at(l) == c && self.at(r) == c);

        let (run_l, end_l) = self.run_of(l);
        let (run_r, _) = self.run_of(r);

        // the range contains only c: do not break
        if run_l == run_r {
            return vec![range];
        }

        let mut result = vec![(l, end_l)];
        let rank_l = self.run_heads.rank(run_l, c);
        let rank_r = self.run_heads.rank(run_r, c);
        for j in rank_l + 1..rank_r {
            result.push(self.run_range(self.run_heads.select(j, c)));
        }
        let (start, _) = self.run_range(self.run_heads.select(rank_r, c));
        result.push((start, r));
        result
    }

    /// Lazy iterator over the runs, starting at position 0.
    pub fn run_iter(&self) -> RunIter<'_> {
        RunIter {
            string: self,
            r_pos: 0,
            clip: None,
        }
    }

    /// Lazy iterator over the runs, starting with the (possibly clipped)
    /// run containing position `i`.
    pub fn run_iter_from(&self, i: usize) -> RunIter<'_> {
        debug_assert!(i < self.n);
        RunIter {
            string: self,
            r_pos: self.run_of(i).0,
            clip: Some(i),
        }
    }

    /// Materializes the string; test and inspection helper.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.n);
        for run in self.run_iter() {
            out.extend(std::iter::repeat(run.symbol).take(run.len));
        }
        out
    }

    /// Returns `(run index, end position of that run)` for the run
    /// containing position `i`.
    fn run_of(&self, i: usize) -> (usize, usize) {
        debug_assert!(i < self.n);
        let last_block = self.runs.rank(i);
        let mut current_run = last_block * self.block_size;
        let mut pos = if last_block > 0 {
            self.runs.select(last_block - 1) + 1
        } else {
            0
        };
        debug_assert!(pos <= i);

        while pos < i {
            pos += self.run_at(current_run);
            current_run += 1;
        }
        if pos > i {
            current_run -= 1;
        } else {
            // pos == i: i is the first position of current_run
            pos += self.run_at(current_run);
        }
        debug_assert!(pos > 0);
        debug_assert!(current_run < self.r);
        (current_run, pos - 1)
    }
}

/// Lazy, restartable iterator over the runs of a [`RleString`].
pub struct RunIter<'a> {
    string: &'a RleString,
    r_pos: usize,
    /// When created mid-string, the first run is clipped to start here.
    clip: Option<usize>,
}

impl<'a> Iterator for RunIter<'a> {
    type Item = Run;

    fn next(&mut self) -> Option<Run> {
        if self.r_pos >= self.string.number_of_runs() {
            return None;
        }
        let mut run = self.string.run(self.r_pos);
        if let Some(start) = self.clip.take() {
            if run.offset < start {
                run.len -= start - run.offset;
                run.offset = start;
            }
        }
        self.r_pos += 1;
        Some(run)
    }
}

/// Number of entries in an [`Accessor`] cache.
const ACCESSOR_CACHE_SIZE: usize = 8;
/// Number of entries in a [`RunCache`].
const RUN_CACHE_SIZE: usize = 2;

/// A small position→symbol cache over a [`RleString`], for access patterns
/// that hit the same neighborhood repeatedly (the rank-array walk).
pub struct Accessor<'a> {
    string: &'a RleString,
    cache: [(usize, u8); ACCESSOR_CACHE_SIZE],
    cursor: usize,
}

impl<'a> Accessor<'a> {
    pub fn new(string: &'a RleString) -> Self {
        Accessor {
            string,
            cache: [(usize::MAX, 0); ACCESSOR_CACHE_SIZE],
            cursor: 0,
        }
    }

    pub fn get(&mut self, i: usize) -> u8 {
        for &(pos, c) in &self.cache {
            if pos == i {
                return c;
            }
        }
        let c = self.string.at(i);
        self.cache[self.cursor] = (i, c);
        self.cursor = (self.cursor + 1) % ACCESSOR_CACHE_SIZE;
        c
    }
}

/// A two-entry cache of recently touched runs; a position falling inside a
/// cached run is answered without touching the succinct structures.
pub struct RunCache<'a> {
    string: &'a RleString,
    cache: [Run; RUN_CACHE_SIZE],
    cursor: usize,
}

impl<'a> RunCache<'a> {
    pub fn new(string: &'a RleString) -> Self {
        RunCache {
            string,
            // offset = usize::MAX never contains a valid position
            cache: [Run {
                offset: usize::MAX,
                len: 1,
                symbol: 0,
            }; RUN_CACHE_SIZE],
            cursor: 0,
        }
    }

    pub fn get(&mut self, pos: usize) -> u8 {
        for run in &self.cache {
            if run.offset != usize::MAX && run.contains(pos) {
                return run.symbol;
            }
        }
        let run = self.string.run(self.string.run_of_position(pos));
        self.cache[self.cursor % RUN_CACHE_SIZE] = run;
        self.cursor += 1;
        run.symbol
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rle::RlEncoder;

    fn naive_rank(data: &[u8], i: usize, c: u8) -> usize {
        data[..i].iter().filter(|&&x| x == c).count()
    }

    #[test]
    fn test_from_bytes_access() {
        let data = b"AAAGCAATTTTTTAAGGAAA";
        let rle = RleString::from_bytes(data);
        assert_eq!(rle.len(), data.len());
        assert_eq!(rle.number_of_runs(), 8);
        for (i, &c) in data.iter().enumerate() {
            assert_eq!(rle.at(i), c, "position {}", i);
        }
        assert_eq!(rle.to_bytes(), data);
    }

    #[test]
    fn test_from_encoder() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.rle");
        let data = b"AAAGCAATTTTTTAAGGAAA";
        let mut encoder = RlEncoder::new(&path)?;
        for &c in data {
            encoder.append(c)?;
        }
        encoder.close()?;

        let rle = RleString::load(&path)?;
        assert_eq!(rle.len(), data.len());
        for (i, &c) in data.iter().enumerate() {
            assert_eq!(rle.at(i), c);
        }
        Ok(())
    }

    #[test]
    fn test_rank_select() {
        let data = b"AAAGCAATTTTTTAAGGAAA";
        let rle = RleString::from_bytes(data);
        for c in [b'A', b'C', b'G', b'T', b'N'] {
            for i in 0..=data.len() {
                assert_eq!(rle.rank(i, c), naive_rank(data, i, c), "rank({}, {})", i, c);
            }
            let occurrences = naive_rank(data, data.len(), c);
            for k in 0..occurrences {
                let pos = rle.select(k, c);
                assert_eq!(data[pos], c);
                assert_eq!(naive_rank(data, pos, c), k, "select({}, {})", k, c);
            }
        }
    }

    #[test]
    fn test_run_ranges() {
        let data = b"AAAGCAATTTTTTAAGGAAA";
        let rle = RleString::from_bytes(data);
        let expected = [
            (0usize, 2usize, b'A'),
            (3, 3, b'G'),
            (4, 4, b'C'),
            (5, 6, b'A'),
            (7, 12, b'T'),
            (13, 14, b'A'),
            (15, 16, b'G'),
            (17, 19, b'A'),
        ];
        for (j, &(start, end, c)) in expected.iter().enumerate() {
            assert_eq!(rle.run_range(j), (start, end));
            assert_eq!(rle.run_at(j), end - start + 1);
            assert_eq!(
                rle.run(j),
                Run {
                    offset: start,
                    len: end - start + 1,
                    symbol: c
                }
            );
        }
        for (i, _) in data.iter().enumerate() {
            let j = rle.run_of_position(i);
            let (start, end) = rle.run_range(j);
            assert!(start <= i && i <= end);
        }
    }

    #[test]
    fn test_run_iter() {
        let data = b"AAAGCAATTTTTTAAGGAAA";
        let rle = RleString::from_bytes(data);
        let runs: Vec<Run> = rle.run_iter().collect();
        assert_eq!(runs.len(), 8);
        assert_eq!(runs[0], Run { offset: 0, len: 3, symbol: b'A' });
        assert_eq!(runs[4], Run { offset: 7, len: 6, symbol: b'T' });
        let total: usize = runs.iter().map(|r| r.len).sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn test_break_range() {
        //                0123456789
        let data = b"ATTAGGATAA";
        let rle = RleString::from_bytes(data);
        // range [0, 9] has 'A' at both ends, spanning three A-runs plus the
        // singleton at 6
        let parts = rle.break_range((0, 9), b'A');
        assert_eq!(parts, vec![(0, 0), (3, 3), (6, 6), (8, 9)]);
        // a range inside a single run is returned unchanged
        let parts = rle.break_range((4, 5), b'G');
        assert_eq!(parts, vec![(4, 5)]);
    }

    #[test]
    fn test_accessor_and_run_cache() {
        let data = b"AGCATAGA";
        let rle = RleString::from_bytes(data);
        let mut accessor = Accessor::new(&rle);
        let mut cache = RunCache::new(&rle);
        for (i, &c) in data.iter().enumerate() {
            assert_eq!(accessor.get(i), c);
            assert_eq!(cache.get(i), c);
        }
        // revisit in reverse to exercise the caches
        for (i, &c) in data.iter().enumerate().rev() {
            assert_eq!(accessor.get(i), c);
            assert_eq!(cache.get(i), c);
        }
    }

    #[test]
    fn test_terminator_substitution() {
        let data = [b'A', 0x00, b'A'];
        let rle = RleString::from_bytes(&data);
        assert_eq!(rle.at(1), DATA_TERMINATOR);
    }
}
