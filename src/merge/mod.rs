/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The merge driver: partitions the left BWT into jobs, runs the rank-array
//! phase and the interleave phase, and fuses the per-job outputs into the
//! merged index.

use anyhow::{ensure, Context, Result};
use log::{info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

pub mod buffers;
pub mod rank_array;
mod interleave;

pub use buffers::{MergeBuffers, PosBuffer, RankArrayIter};
pub use rank_array::SaUpdates;

use crate::index::{RIndex, BWT_FILE, SAMPLES_FILE};
use crate::rle::{meta_path, SegmentMerger};
use crate::utils::{concatenate_file, partition, MEGABYTE, TMPDIR_ENV};

/// Tuning knobs of the merge.
#[derive(Clone, Debug)]
pub struct MergeParameters {
    /// Per-producer position buffer, in megabytes.
    pub pos_buffer_size: usize,
    /// Per-slot spill buffer, in megabytes.
    pub thread_buffer_size: usize,
    /// Producer threads walking right sequences.
    pub search_jobs: usize,
    /// Interleave jobs (and threads).
    pub merge_jobs: usize,
    /// Directory for spill and per-job scratch files; falls back to the
    /// `RIMERGE_TMPDIR` environment variable, then to the system temp path.
    pub temp_dir: Option<PathBuf>,
}

impl MergeParameters {
    pub const POS_BUFFER_SIZE: usize = 64; // Megabytes.
    pub const THREAD_BUFFER_SIZE: usize = 256; // Megabytes.
    pub const MERGE_JOBS: usize = 4;

    pub const MAX_BUFFER_SIZE: usize = 16384; // Megabytes.
    pub const MAX_MERGE_JOBS: usize = 16;

    /// Clamps a value into `[low, high]`.
    fn bound(value: usize, low: usize, high: usize) -> usize {
        value.clamp(low, high)
    }

    pub fn set_pos_buffer_size(&mut self, megabytes: usize) -> &mut Self {
        self.pos_buffer_size = Self::bound(megabytes, 1, Self::MAX_BUFFER_SIZE);
        self
    }

    pub fn set_thread_buffer_size(&mut self, megabytes: usize) -> &mut Self {
        self.thread_buffer_size = Self::bound(megabytes, 1, Self::MAX_BUFFER_SIZE);
        self
    }

    pub fn set_search_jobs(&mut self, jobs: usize) -> &mut Self {
        self.search_jobs = jobs.max(1);
        self
    }

    pub fn set_merge_jobs(&mut self, jobs: usize) -> &mut Self {
        self.merge_jobs = Self::bound(jobs, 1, Self::MAX_MERGE_JOBS);
        self
    }

    pub fn set_temp_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Capacity of a producer buffer, in positions.
    pub fn pos_buffer_positions(&self) -> usize {
        (self.pos_buffer_size * MEGABYTE) / core::mem::size_of::<u64>()
    }

    /// Capacity of a spill slot, in bytes.
    pub fn thread_buffer_bytes(&self) -> usize {
        self.thread_buffer_size * MEGABYTE
    }

    /// The effective scratch directory.
    pub fn scratch_root(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .or_else(|| std::env::var_os(TMPDIR_ENV).map(PathBuf::from))
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for MergeParameters {
    fn default() -> Self {
        MergeParameters {
            pos_buffer_size: Self::POS_BUFFER_SIZE,
            thread_buffer_size: Self::THREAD_BUFFER_SIZE,
            search_jobs: num_cpus::get(),
            merge_jobs: Self::MERGE_JOBS,
            temp_dir: None,
        }
    }
}

/// Vital statistics of the merged index, for the final summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeSummary {
    pub size: u64,
    pub runs: u64,
    pub sequences: u64,
    pub samples: u64,
}

impl MergeSummary {
    fn log(&self) {
        info!(
            "Merged index: size {}, runs {}, sequences {}, samples {}, n/r {:.2}",
            self.size,
            self.runs,
            self.sequences,
            self.samples,
            self.size as f64 / self.runs as f64
        );
    }
}

/// Merges the indexes stored in `left_dir` and `right_dir` into `out_dir`.
///
/// An empty right index is a logical no-op: the left index files are copied
/// to the output unchanged.
pub fn merge(
    left_dir: impl AsRef<Path>,
    right_dir: impl AsRef<Path>,
    out_dir: impl AsRef<Path>,
    parameters: &MergeParameters,
) -> Result<MergeSummary> {
    let (left_dir, right_dir, out_dir) = (left_dir.as_ref(), right_dir.as_ref(), out_dir.as_ref());

    info!("Reading the left index from {}", left_dir.display());
    let left = RIndex::load(left_dir)?;
    info!(
        "Left index: size {}, sequences {}, runs {}",
        left.len(),
        left.sequences(),
        left.runs()
    );

    info!("Reading the right index from {}", right_dir.display());
    let right = RIndex::load(right_dir)?;
    info!(
        "Right index: size {}, sequences {}, runs {}",
        right.len(),
        right.sequences(),
        right.runs()
    );

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Could not create {}", out_dir.display()))?;

    if right.is_empty() {
        warn!("The right index is empty: copying the left index unchanged");
        for name in [BWT_FILE, SAMPLES_FILE] {
            std::fs::copy(left_dir.join(name), out_dir.join(name))
                .with_context(|| format!("Could not copy {}", name))?;
        }
        std::fs::copy(
            meta_path(left_dir.join(BWT_FILE)),
            meta_path(out_dir.join(BWT_FILE)),
        )
        .context("Could not copy the BWT metadata")?;
        return Ok(MergeSummary {
            size: left.len() as u64,
            runs: left.runs() as u64,
            sequences: left.sequences() as u64,
            samples: left.samples().len() as u64,
        });
    }

    merge_indexes(&left, &right, out_dir, parameters)
}

/// Merges two loaded indexes into `out_dir`. The right index must be
/// non-empty (the caller handles the no-op case).
pub fn merge_indexes(
    left: &RIndex,
    right: &RIndex,
    out_dir: impl AsRef<Path>,
    parameters: &MergeParameters,
) -> Result<MergeSummary> {
    let out_dir = out_dir.as_ref();
    ensure!(!left.is_empty(), "The left index is empty");
    ensure!(!right.is_empty(), "The right index is empty");
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Could not create {}", out_dir.display()))?;

    let result = run_merge(left, right, out_dir, parameters);
    if result.is_err() {
        // remove partial outputs
        for path in [
            out_dir.join(BWT_FILE),
            meta_path(out_dir.join(BWT_FILE)),
            out_dir.join(SAMPLES_FILE),
        ] {
            let _ = std::fs::remove_file(path);
        }
    }
    result
}

fn run_merge(
    left: &RIndex,
    right: &RIndex,
    out_dir: &Path,
    parameters: &MergeParameters,
) -> Result<MergeSummary> {
    let start = std::time::Instant::now();
    let scratch_root = parameters.scratch_root();
    std::fs::create_dir_all(&scratch_root)
        .with_context(|| format!("Could not create {}", scratch_root.display()))?;
    let scratch = tempfile::Builder::new()
        .prefix("rimerge-")
        .tempdir_in(&scratch_root)
        .with_context(|| format!("Could not create scratch space in {}", scratch_root.display()))?;

    // phase A: build the rank array
    let job_ranges = partition(left.len(), parameters.merge_jobs);
    let mut merge_buffers = MergeBuffers::new(
        job_ranges,
        scratch.path(),
        parameters.pos_buffer_positions(),
        parameters.thread_buffer_bytes(),
        parameters.search_jobs,
    );
    let stop = AtomicBool::new(false);

    let search_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parameters.search_jobs)
        .thread_name(|i| format!("search-{}", i))
        .build()
        .context("Could not build the search pool")?;
    let (thread_maps, produced) =
        rank_array::build_rank_array(left, right, &merge_buffers, &search_pool, &stop)?;
    merge_buffers.flush()?;

    // phase barrier: reduce the per-thread maps into the canonical ones
    let updates = rank_array::reduce(thread_maps);
    info!(
        "Rank array built: {} values, {} sample-update entries",
        produced,
        updates.len()
    );

    // phase B: interleave, one job per thread
    let jobs = merge_buffers.job_ranges().len();
    let merge_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .thread_name(|i| format!("merge-{}", i))
        .build()
        .context("Could not build the merge pool")?;
    let buffers_ref = &merge_buffers;
    let updates_ref = &updates;
    let scratch_path = scratch.path();
    let results: Vec<Result<interleave::JobOutput>> = merge_pool.broadcast(|ctx| {
        interleave::interleave_job(ctx.index(), left, right, buffers_ref, updates_ref, scratch_path)
    });

    let mut outputs = Vec::with_capacity(results.len());
    for result in results {
        outputs.push(result?);
    }
    let symbols: u64 = outputs.iter().map(|o| o.symbols).sum();
    let samples_emitted: u64 = outputs.iter().map(|o| o.samples_emitted).sum();
    ensure!(
        symbols == (left.len() + right.len()) as u64,
        "Interleaved {} symbols, expected {}",
        symbols,
        left.len() + right.len()
    );
    info!(
        "Interleave complete: {} symbols, {} samples emitted",
        symbols, samples_emitted
    );

    // fuse the per-job segments and concatenate the per-job sample files
    let segment_paths: Vec<PathBuf> = outputs.iter().map(|o| o.segment.clone()).collect();
    let merged_meta = SegmentMerger::new(out_dir.join(BWT_FILE)).merge(&segment_paths)?;

    let samples_path = out_dir.join(SAMPLES_FILE);
    let mut samples_out = BufWriter::new(
        File::create(&samples_path)
            .with_context(|| format!("Could not create {}", samples_path.display()))?,
    );
    for output in &outputs {
        concatenate_file(&mut samples_out, &output.samples)?;
    }
    samples_out
        .flush()
        .with_context(|| format!("Could not flush {}", samples_path.display()))?;

    merge_buffers.delete_spills()?;

    let sequences = if merged_meta.size_per_char[crate::utils::STRING_TERMINATOR as usize] > 0 {
        merged_meta.size_per_char[crate::utils::STRING_TERMINATOR as usize]
    } else {
        merged_meta.size_per_char[crate::utils::DATA_TERMINATOR as usize]
    };
    let summary = MergeSummary {
        size: merged_meta.size,
        runs: merged_meta.runs,
        sequences,
        samples: samples_emitted,
    };
    summary.log();
    info!(
        "Merged {} sequences in {:.2} s",
        right.sequences(),
        start.elapsed().as_secs_f64()
    );
    Ok(summary)
}
