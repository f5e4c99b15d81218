/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Phase A of the merge: every sequence of the right index is walked
//! backwards through both LF mappings, producing for each right BWT
//! position the number of left symbols that must precede it in the merged
//! BWT (the rank array), and recording the suffix-array samples that the
//! interleaver will need where an insertion interrupts a left run.

use anyhow::{ensure, Context, Result};
use dsi_progress_logger::prelude::*;
use log::debug;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::buffers::{MergeBuffers, PosBuffer};
use crate::index::RIndex;
use crate::rle::Accessor;
use crate::utils::{is_terminator, INVALID_VALUE};

/// The sample bookkeeping of one producer thread (and, after
/// [`reduce`], of the whole merge).
///
/// All three maps are keyed by rank-array value. `left` holds left-index SA
/// values needed on either side of an interruption point; `right_min` and
/// `right_max` hold `(j, SA[j])` entries from the right index, keeping the
/// smallest respectively largest `j` seen for the key.
#[derive(Debug, Default)]
pub struct SaUpdates {
    pub left: HashMap<usize, u64>,
    pub right_min: HashMap<usize, (usize, u64)>,
    pub right_max: HashMap<usize, (usize, u64)>,
}

impl SaUpdates {
    pub fn find_left(&self, ra_value: usize) -> Option<u64> {
        self.left.get(&ra_value).copied()
    }

    pub fn find_right_min(&self, ra_value: usize) -> Option<(usize, u64)> {
        self.right_min.get(&ra_value).copied()
    }

    pub fn find_right_max(&self, ra_value: usize) -> Option<(usize, u64)> {
        self.right_max.get(&ra_value).copied()
    }

    /// Number of entries across the three maps.
    pub fn len(&self) -> usize {
        self.left.len() + self.right_min.len() + self.right_max.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the sample pair for the interruption at `ra_i`/`ra_j`: the
    /// propagated previous pair when the insertion extends the same
    /// interruption, the already-recorded pair when the key is known, or a
    /// freshly computed one from the nearest sampled occurrences in the left
    /// index.
    #[allow(clippy::too_many_arguments)]
    fn update_left(
        &mut self,
        left: &RIndex,
        ra_i: usize,
        ra_j: usize,
        prev: (u64, u64),
        i: usize,
        left_acc: &mut Accessor,
        right_acc: &mut Accessor,
    ) -> Result<(u64, u64)> {
        if self.left.contains_key(&ra_j) && self.left.contains_key(&(ra_j - 1)) {
            return Ok((self.left[&(ra_j - 1)], self.left[&ra_j]));
        }

        let c = right_acc.get(i);
        if ra_i < left.len()
            && left_acc.get(ra_i - 1) == left_acc.get(ra_i)
            && c == left_acc.get(ra_i)
        {
            // same run, same symbol: the previous pair shifts by one
            return Ok((prev.0.wrapping_sub(1), prev.1.wrapping_sub(1)));
        }

        let n = left.len();
        // rightmost occurrence of c at a position < ra_i, or the last
        // occurrence of the nearest smaller symbol
        let before = left.rank(ra_i.min(n), c);
        let p1 = if before > 0 {
            left.select(before - 1, c)
        } else {
            let prev_c = left.alphabet().previous(c);
            let occurrences = left.rank(n, prev_c);
            ensure!(
                occurrences > 0,
                "The left index has no occurrence of {:#04x} nor of its predecessor {:#04x}",
                c,
                prev_c
            );
            left.select(occurrences - 1, prev_c)
        };
        // leftmost occurrence of c at a position >= ra_i, or the first
        // occurrence of the nearest greater symbol
        let p2 = if left.rank(n, c) - before > 0 {
            left.select(before, c)
        } else {
            let next_c = left.alphabet().following(c);
            let occurrences = left.rank(n, next_c);
            ensure!(
                occurrences > 0,
                "The left index has no occurrence of {:#04x} nor of its successor {:#04x}",
                c,
                next_c
            );
            left.select(0, next_c)
        };

        let s1 = left
            .samples()
            .get(p1)
            .with_context(|| format!("Missing left sample at run boundary {}", p1))?;
        let s2 = left
            .samples()
            .get(p2)
            .with_context(|| format!("Missing left sample at run boundary {}", p2))?;
        let n = n as u64;
        Ok(((s1 + n - 1) % n, (s2 + n - 1) % n))
    }

    /// Records `(j, sa_value)` under `ra_j` when the insertion leaves the
    /// right symbol without a native sample and not mergeable with the left
    /// run ending at `ra_j - 1`; a later candidate that would merge with
    /// that run erases the entry instead.
    fn update_right_min(
        &mut self,
        right: &RIndex,
        ra_j: usize,
        j: usize,
        sa_value: u64,
        left_acc: &mut Accessor,
        right_acc: &mut Accessor,
    ) {
        match self.right_min.entry(ra_j) {
            Entry::Occupied(entry) => {
                let (stored_j, _) = *entry.get();
                if j < stored_j && left_acc.get(ra_j - 1) == right_acc.get(j) {
                    entry.remove();
                } else if j < stored_j {
                    *entry.into_mut() = (j, sa_value);
                }
            }
            Entry::Vacant(slot) => {
                if right.its(j).is_empty() && left_acc.get(ra_j - 1) != right_acc.get(j) {
                    slot.insert((j, sa_value));
                }
            }
        }
    }

    /// Symmetric bookkeeping against the left run starting at `ra_j`; an
    /// insertion after the whole left BWT (`ra_j = |L|`) is always recorded.
    #[allow(clippy::too_many_arguments)]
    fn update_right_max(
        &mut self,
        left_len: usize,
        right: &RIndex,
        ra_j: usize,
        j: usize,
        sa_value: u64,
        left_acc: &mut Accessor,
        right_acc: &mut Accessor,
    ) {
        match self.right_max.entry(ra_j) {
            Entry::Occupied(entry) => {
                let (stored_j, _) = *entry.get();
                if j > stored_j && ra_j < left_len && left_acc.get(ra_j) == right_acc.get(j) {
                    entry.remove();
                } else if j > stored_j {
                    *entry.into_mut() = (j, sa_value);
                }
            }
            Entry::Vacant(slot) => {
                if ra_j >= left_len {
                    slot.insert((j, sa_value));
                } else if right.its(j).is_empty() && left_acc.get(ra_j) != right_acc.get(j) {
                    slot.insert((j, sa_value));
                }
            }
        }
    }
}

/// Merges the per-thread maps into the canonical global maps, in thread
/// order: first writer wins for `left`, the smallest `j` wins for
/// `right_min`, the largest `j` for `right_max`.
pub fn reduce(thread_maps: Vec<SaUpdates>) -> SaUpdates {
    let mut global = SaUpdates::default();
    for maps in thread_maps {
        for (key, value) in maps.left {
            global.left.entry(key).or_insert(value);
        }
        for (key, value) in maps.right_min {
            match global.right_min.entry(key) {
                Entry::Occupied(mut entry) => {
                    if value.0 < entry.get().0 {
                        entry.insert(value);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
            }
        }
        for (key, value) in maps.right_max {
            match global.right_max.entry(key) {
                Entry::Occupied(mut entry) => {
                    if value.0 > entry.get().0 {
                        entry.insert(value);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
            }
        }
    }
    global
}

/// Walks one right sequence backwards, emitting rank-array values and
/// recording interruption samples.
fn walk_sequence(
    seq: usize,
    left: &RIndex,
    right: &RIndex,
    producer: &mut PosBuffer<'_>,
    maps: &mut SaUpdates,
    left_acc: &mut Accessor<'_>,
    right_acc: &mut Accessor<'_>,
) -> Result<()> {
    let mut i = seq;
    let mut ra_i = left.sequences();
    let mut right_sa = right.samples().get(seq).unwrap_or(INVALID_VALUE);
    producer.insert(ra_i)?;

    let mut prev = (
        left.samples().get(ra_i - 1).unwrap_or(INVALID_VALUE),
        left.samples().get(ra_i).unwrap_or(INVALID_VALUE),
    );
    maps.left.entry(ra_i - 1).or_insert(prev.0);
    maps.left.entry(ra_i).or_insert(prev.1);
    debug!(
        "sequence {}: BWT[{}] = {:#04x}, SA[{}] = {}",
        seq,
        i,
        right_acc.get(i),
        i,
        right_sa
    );

    while !is_terminator(right_acc.get(i)) {
        let c = right_acc.get(i);
        let j = right.lf_c(i, c);
        right_sa = right_sa.wrapping_sub(1);
        let ra_j = left.lf_c(ra_i, c);
        producer.insert(ra_j)?;

        prev = maps.update_left(left, ra_i, ra_j, prev, i, left_acc, right_acc)?;

        // the insertion breaks the run ending at ra_j - 1
        if right_acc.get(j) != left_acc.get(ra_j - 1) && left.its(ra_j - 1).is_empty() {
            maps.left.entry(ra_j - 1).or_insert(prev.0);
            maps.left.entry(ra_j).or_insert(prev.1);
        }
        // or the run starting at ra_j
        if ra_j < left.len()
            && right_acc.get(j) != left_acc.get(ra_j)
            && left.its(ra_j).is_empty()
        {
            maps.left.entry(ra_j - 1).or_insert(prev.0);
            maps.left.entry(ra_j).or_insert(prev.1);
        }

        maps.update_right_min(right, ra_j, j, right_sa, left_acc, right_acc);
        maps.update_right_max(left.len(), right, ra_j, j, right_sa, left_acc, right_acc);

        i = j;
        ra_i = ra_j;
    }
    Ok(())
}

/// Runs phase A over all sequences of `right` on the given pool, flushing
/// the producer buffers after every sequence, and returns the per-thread
/// maps in thread order together with the number of rank-array values
/// produced.
pub fn build_rank_array(
    left: &RIndex,
    right: &RIndex,
    buffers: &MergeBuffers,
    pool: &rayon::ThreadPool,
    stop: &AtomicBool,
) -> Result<(Vec<SaUpdates>, u64)> {
    let next_sequence = AtomicUsize::new(0);
    let mut pl = ProgressLogger::default();
    pl.item_name("sequence")
        .expected_updates(Some(right.sequences()));
    pl.start("Building the rank array...");
    let pl = Mutex::new(pl);

    let results: Vec<Result<(SaUpdates, u64)>> = pool.broadcast(|_| {
        let mut maps = SaUpdates::default();
        let mut producer = buffers.producer();
        let mut left_acc = Accessor::new(left.bwt());
        let mut right_acc = Accessor::new(right.bwt());

        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let seq = next_sequence.fetch_add(1, Ordering::Relaxed);
            if seq >= right.sequences() {
                break;
            }
            if let Err(e) = walk_sequence(
                seq,
                left,
                right,
                &mut producer,
                &mut maps,
                &mut left_acc,
                &mut right_acc,
            ) {
                stop.store(true, Ordering::Relaxed);
                return Err(e);
            }
            // hand the sequence's values to the merger
            producer.flush()?;
            pl.lock().unwrap().update();
        }
        let produced = producer.finish()?;
        Ok((maps, produced))
    });

    let mut thread_maps = Vec::with_capacity(results.len());
    let mut produced = 0;
    let mut first_error = None;
    for result in results {
        match result {
            Ok((maps, count)) => {
                thread_maps.push(maps);
                produced += count;
            }
            Err(e) => first_error = Some(first_error.unwrap_or(e)),
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    ensure!(
        produced == right.len() as u64,
        "Produced {} rank-array values for a right index of size {}",
        produced,
        right.len()
    );
    pl.into_inner().unwrap().done();
    Ok((thread_maps, produced))
}
