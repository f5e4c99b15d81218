/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Phase B of the merge: one consumer per job interleaves the left and
//! right BWTs following the job's rank-array stream, emitting a run-length
//! encoded segment and the suffix-array samples the merged index keeps at
//! its run boundaries.

use anyhow::{bail, Context, Result};
use log::{debug, info};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::buffers::MergeBuffers;
use super::rank_array::SaUpdates;
use crate::index::RIndex;
use crate::rle::{RlEncoder, RunCache};
use crate::samples::write_sample;

/// Sentinel for "no further rank-array value".
const RA_INVALID: usize = usize::MAX;

/// Files and counters produced by one interleave job.
pub(crate) struct JobOutput {
    pub segment: PathBuf,
    pub samples: PathBuf,
    pub symbols: u64,
    pub samples_emitted: u64,
}

/// Decides, for every emitted symbol, whether the merged index needs a
/// sample at that position, and where its value comes from: the native
/// samples of either input or the update maps built during phase A.
struct SamplesMerger<'a, W: Write> {
    left: &'a RIndex,
    right: &'a RIndex,
    updates: &'a SaUpdates,
    out: &'a mut W,
    job: usize,
    /// Whether the most recently emitted symbol came from the left BWT.
    lfl: bool,
    /// Index into the left BWT of the last emitted left symbol.
    lli: usize,
    /// Index into the right BWT of the last emitted right symbol.
    lri: usize,
    emitted: u64,
}

impl<'a, W: Write> SamplesMerger<'a, W> {
    fn write(&mut self, position: usize, value: u64) -> Result<()> {
        write_sample(self.out, position as u64, value)?;
        self.emitted += 1;
        Ok(())
    }

    fn left_sample(&self, index: usize, position: usize) -> Result<u64> {
        self.left.samples().get(index).with_context(|| {
            format!(
                "Job {}: missing native left sample at index {} (merged position {})",
                self.job, index, position
            )
        })
    }

    fn right_sample(&self, index: usize, position: usize) -> Result<u64> {
        let shift = self.left.len() as u64;
        Ok(self
            .right
            .samples()
            .get(index)
            .with_context(|| {
                format!(
                    "Job {}: missing native right sample at index {} (merged position {})",
                    self.job, index, position
                )
            })?
            + shift)
    }

    /// Whether `c` differs from the left symbol following the last emitted
    /// one; when the whole left BWT has been emitted there is no such
    /// symbol and the answer is "different".
    fn differs_from_next_left(&self, c: u8, left_cache: &mut RunCache<'_>) -> bool {
        let next = self.lli + 1;
        next >= self.left.len() || left_cache.get(next) != c
    }

    /// Whether `c` differs from the right symbol following the last emitted
    /// one (the pending insertion).
    fn differs_from_next_right(&self, c: u8, right_cache: &mut RunCache<'_>) -> bool {
        let next = self.lri + 1;
        next >= self.right.len() || right_cache.get(next) != c
    }

    /// One emission step. `index` is the position in the source BWT
    /// (`fl` selects left or right), `position` the position in the merged
    /// BWT, and the three `ra` values the current window over the job's
    /// rank-array stream.
    #[allow(clippy::too_many_arguments)]
    fn emit(
        &mut self,
        index: usize,
        right_cache: &mut RunCache<'_>,
        left_cache: &mut RunCache<'_>,
        fl: bool,
        position: usize,
        ra_value: usize,
        prev_ra_value: usize,
        next_ra_value: usize,
    ) -> Result<()> {
        // the first position after the sequence-head region gets the source
        // sample when the source position carries one
        if position == self.left.sequences() + self.right.sequences() {
            if fl {
                if let Some(value) = self.left.samples().get(index) {
                    self.write(position, value)?;
                }
                self.lfl = true;
                self.lli = index;
            } else {
                if let Some(value) = self.right.samples().get(index) {
                    self.write(position, value + self.left.len() as u64)?;
                }
                self.lfl = false;
                self.lri = index;
            }
        }

        if fl && index < self.left.sequences() {
            // sequence heads from the left
            let value = self.left_sample(index, position)?;
            self.write(position, value)?;
            self.lfl = true;
            self.lli = index;
        } else if !fl && index < self.right.sequences() {
            // sequence heads from the right
            let value = self.right_sample(index, position)?;
            self.write(position, value)?;
            self.lfl = false;
            self.lri = index;
        } else if fl && index == self.left.len() - 1 {
            let value = self.left_sample(index, position)?;
            self.write(position, value)?;
            self.lfl = true;
            self.lli = index;
        } else if !fl && index == self.right.len() - 1 {
            let value = self.right_sample(index, position)?;
            self.write(position, value)?;
            self.lfl = false;
            self.lri = index;
        } else if fl && self.lfl {
            let genre = self.left.its(index);
            if !genre.is_empty() {
                if genre.is_start() || (genre.is_end() && index != ra_value.wrapping_sub(1)) {
                    let value = self.left_sample(index, position)?;
                    self.write(position, value)?;
                } else if index == ra_value.wrapping_sub(1)
                    && self.differs_from_next_right(left_cache.get(index), right_cache)
                {
                    let value = self.left_sample(index, position)?;
                    self.write(position, value)?;
                }
            } else if index == ra_value.wrapping_sub(1)
                && self.differs_from_next_right(left_cache.get(index), right_cache)
            {
                match self.updates.find_left(ra_value - 1) {
                    Some(value) => self.write(position, value)?,
                    None => bail!(
                        "Job {}: sample missing in the left map for rank-array value {} \
                         (merged position {})",
                        self.job,
                        ra_value,
                        position
                    ),
                }
            }
            self.lfl = true;
            self.lli = index;
        } else if fl && !self.lfl {
            let genre = self.left.its(index);
            if left_cache.get(index) != right_cache.get(self.lri) {
                if let Some(value) = self.updates.find_left(prev_ra_value) {
                    self.write(position, value)?;
                } else if !genre.is_empty() {
                    let value = self.left_sample(index, position)?;
                    self.write(position, value)?;
                } else {
                    bail!(
                        "Job {}: sample missing in the left map for rank-array value {} \
                         (merged position {})",
                        self.job,
                        prev_ra_value,
                        position
                    );
                }
            } else if index == ra_value.wrapping_sub(1)
                && self.differs_from_next_right(left_cache.get(index), right_cache)
            {
                if let Some(value) = self.updates.find_left(ra_value - 1) {
                    self.write(position, value)?;
                } else if !genre.is_empty() {
                    let value = self.left_sample(index, position)?;
                    self.write(position, value)?;
                } else {
                    bail!(
                        "Job {}: sample missing in the left map for rank-array value {} \
                         (merged position {})",
                        self.job,
                        ra_value,
                        position
                    );
                }
            } else if index != ra_value.wrapping_sub(1) && genre.is_end() {
                let value = self.left_sample(index, position)?;
                self.write(position, value)?;
            }
            self.lfl = true;
            self.lli = index;
        } else if !fl && !self.lfl {
            let genre = self.right.its(index);
            if !genre.is_empty() {
                if genre.is_start() || (genre.is_end() && ra_value == next_ra_value) {
                    let value = self.right_sample(index, position)?;
                    self.write(position, value)?;
                } else if ra_value != next_ra_value
                    && self.differs_from_next_left(right_cache.get(index), left_cache)
                {
                    let value = self.right_sample(index, position)?;
                    self.write(position, value)?;
                }
            } else if ra_value != next_ra_value
                && self.differs_from_next_left(right_cache.get(index), left_cache)
            {
                match self.updates.find_right_max(ra_value) {
                    Some((_, value)) => {
                        let value = value + self.left.len() as u64;
                        self.write(position, value)?;
                    }
                    None => bail!(
                        "Job {}: sample missing in the right-max map for rank-array value {} \
                         (merged position {})",
                        self.job,
                        ra_value,
                        position
                    ),
                }
            }
            self.lfl = false;
            self.lri = index;
        } else {
            // !fl && self.lfl
            let genre = self.right.its(index);
            if !genre.is_empty() {
                if right_cache.get(index) != left_cache.get(self.lli) {
                    let value = self.right_sample(index, position)?;
                    self.write(position, value)?;
                } else if ra_value != next_ra_value
                    && self.differs_from_next_left(right_cache.get(index), left_cache)
                {
                    let value = self.right_sample(index, position)?;
                    self.write(position, value)?;
                } else if ra_value == next_ra_value && genre.is_end() {
                    let value = self.right_sample(index, position)?;
                    self.write(position, value)?;
                }
            } else if right_cache.get(index) != left_cache.get(self.lli) {
                match self.updates.find_right_min(ra_value) {
                    Some((_, value)) => {
                        let value = value + self.left.len() as u64;
                        self.write(position, value)?;
                    }
                    None => bail!(
                        "Job {}: sample missing in the right-min map for rank-array value {} \
                         (merged position {})",
                        self.job,
                        ra_value,
                        position
                    ),
                }
            } else if ra_value != next_ra_value
                && self.differs_from_next_left(right_cache.get(index), left_cache)
            {
                match self.updates.find_right_max(ra_value) {
                    Some((_, value)) => {
                        let value = value + self.left.len() as u64;
                        self.write(position, value)?;
                    }
                    None => bail!(
                        "Job {}: sample missing in the right-max map for rank-array value {} \
                         (merged position {})",
                        self.job,
                        ra_value,
                        position
                    ),
                }
            }
            self.lfl = false;
            self.lri = index;
        }
        Ok(())
    }
}

/// Runs one interleave job: emits the job's slice of the left BWT with the
/// right symbols inserted at their rank-array positions, producing a
/// segment file and a sample file.
pub(crate) fn interleave_job(
    job: usize,
    left: &RIndex,
    right: &RIndex,
    buffers: &MergeBuffers,
    updates: &SaUpdates,
    scratch: &Path,
) -> Result<JobOutput> {
    let ranges = buffers.job_ranges();
    let range = ranges[job];
    let segment_path = scratch.join(format!("segment_{:04x}.rle", job));
    let samples_path = scratch.join(format!("samples_{:04x}.saes", job));

    let mut encoder = RlEncoder::new(&segment_path)?;
    let mut saes = BufWriter::new(
        File::create(&samples_path)
            .with_context(|| format!("Could not create {}", samples_path.display()))?,
    );

    let mut left_iter = range.start;
    // symbols inserted from the right by the previous jobs
    let mut right_iter: usize = (0..job).map(|k| buffers.count(k) as usize).sum();
    let last_non_empty = (0..job).rev().find(|&k| buffers.count(k) != 0);

    let mut merger = SamplesMerger {
        left,
        right,
        updates,
        out: &mut saes,
        job,
        lfl: true,
        lli: left_iter.saturating_sub(1),
        lri: right_iter.saturating_sub(1),
        emitted: 0,
    };

    let mut prev_ra = 0usize;
    if job != 0 {
        prev_ra = last_non_empty
            .and_then(|k| buffers.max_value(k))
            .map(|v| v as usize)
            .unwrap_or(0);
        // a previous job ending exactly at our fencepost inserted right
        // symbols just before our first position
        merger.lfl = prev_ra != range.start;
    }

    let mut left_cache = RunCache::new(left.bwt());
    let mut right_cache = RunCache::new(right.bwt());

    // the minimum of the next non-empty job, used as the final window value
    let cross_job_min = (job + 1..ranges.len())
        .find(|&k| buffers.count(k) != 0)
        .and_then(|k| buffers.min_value(k))
        .map(|v| v as usize);

    let mut stream = buffers.iter_job(job)?.map(|v| v as usize);
    let mut tok = true;
    let mut curr_ra = stream.next().unwrap_or(RA_INVALID);
    let mut front = stream.next();
    let mut next_ra = front.unwrap_or(RA_INVALID);
    if front.is_none() && curr_ra != RA_INVALID {
        if let Some(min) = cross_job_min {
            next_ra = min;
            tok = false;
        }
    }

    info!(
        "Job {}: range [{}, {}), {} rank-array values, left_iter {}, right_iter {}",
        job,
        range.start,
        range.end,
        buffers.count(job),
        left_iter,
        right_iter
    );

    while curr_ra != RA_INVALID {
        // symbols from the left, up to the insertion point
        while left_iter < curr_ra {
            encoder.append(left_cache.get(left_iter))?;
            merger.emit(
                left_iter,
                &mut right_cache,
                &mut left_cache,
                true,
                left_iter + right_iter,
                curr_ra,
                prev_ra,
                next_ra,
            )?;
            left_iter += 1;
        }

        // one symbol from the right
        encoder.append(right_cache.get(right_iter))?;
        merger.emit(
            right_iter,
            &mut right_cache,
            &mut left_cache,
            false,
            left_iter + right_iter,
            curr_ra,
            prev_ra,
            next_ra,
        )?;

        // shift the window
        prev_ra = curr_ra;
        if !tok {
            curr_ra = RA_INVALID;
        } else {
            curr_ra = next_ra;
            front = stream.next();
        }
        if front.is_none() && tok {
            match cross_job_min {
                Some(min) => {
                    next_ra = min;
                    tok = false;
                }
                None => next_ra = RA_INVALID,
            }
        } else {
            next_ra = front.unwrap_or(RA_INVALID);
        }

        right_iter += 1;
    }

    // the remaining slice of the left BWT
    while left_iter < range.end {
        encoder.append(left_cache.get(left_iter))?;
        merger.emit(
            left_iter,
            &mut right_cache,
            &mut left_cache,
            true,
            left_iter + right_iter,
            curr_ra,
            prev_ra,
            next_ra,
        )?;
        left_iter += 1;
    }

    debug!(
        "Job {}: last left position {}, {} samples",
        job,
        left_iter.saturating_sub(1),
        merger.emitted
    );

    let samples_emitted = merger.emitted;
    saes.flush()
        .with_context(|| format!("Could not flush {}", samples_path.display()))?;
    let meta = encoder.close()?;

    Ok(JobOutput {
        segment: segment_path,
        samples: samples_path,
        symbols: meta.size,
        samples_emitted,
    })
}
