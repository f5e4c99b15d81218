/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Bounded producer/consumer buffering for rank-array values.
//!
//! Producers collect values in per-thread buffers; each buffer is sorted,
//! run-length counted, binned by job range, and handed over a bounded
//! channel to a merger thread owning one spill slot per job. A slot
//! accumulates batches until its memory cap and then writes one sorted
//! γ-coded run file. Consumers merge a job's run files back into a single
//! ascending stream with duplicates preserved.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use dary_heap::PeekMut;
use dsi_bitstream::prelude::*;
use mmap_rs::MmapFlags;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::utils::{bin, ArcMmapHelper, JobRange, MmapHelper};

pub type BitWriter = BufBitWriter<NE, WordAdapter<usize, BufWriter<File>>>;
pub type BitReader = BufBitReader<NE, MemWordReader<u32, ArcMmapHelper<u32>>>;

/// One sorted batch of `(value, count)` runs destined to one job.
type Batch = (usize, Vec<(u64, u64)>);

/// Spill state of one job after the producer phase.
#[derive(Debug, Default)]
struct Slot {
    pending: Vec<(u64, u64)>,
    pending_bytes: usize,
    files: Vec<(PathBuf, u64)>,
    spilled: usize,
    count: u64,
    min: Option<u64>,
    max: Option<u64>,
}

/// The shared buffering structure of one merge: J spill slots fed by any
/// number of producer buffers.
pub struct MergeBuffers {
    job_ranges: Vec<JobRange>,
    pos_buffer_positions: usize,
    tx: Option<Sender<Batch>>,
    merger: Option<JoinHandle<Result<Vec<Slot>>>>,
    slots: Vec<Slot>,
}

impl MergeBuffers {
    /// Creates the buffers for the given job partition.
    ///
    /// `pos_buffer_positions` caps each producer buffer (in values) and
    /// `thread_buffer_bytes` caps each spill slot's in-RAM batch storage;
    /// `producers` sizes the hand-over channel.
    pub fn new(
        job_ranges: Vec<JobRange>,
        spill_dir: impl AsRef<Path>,
        pos_buffer_positions: usize,
        thread_buffer_bytes: usize,
        producers: usize,
    ) -> Self {
        let jobs = job_ranges.len();
        let merger_dir = spill_dir.as_ref().to_owned();
        let (tx, rx) = crossbeam_channel::bounded::<Batch>(producers.max(1) * 2);
        let merger = std::thread::Builder::new()
            .name("ra-merger".into())
            .spawn(move || merger_loop(rx, jobs, merger_dir, thread_buffer_bytes))
            .expect("could not spawn the rank-array merger thread");
        MergeBuffers {
            job_ranges,
            pos_buffer_positions,
            tx: Some(tx),
            merger: Some(merger),
            slots: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn job_ranges(&self) -> &[JobRange] {
        &self.job_ranges
    }

    /// A new producer buffer; one per worker thread.
    pub fn producer(&self) -> PosBuffer<'_> {
        PosBuffer {
            ranges: &self.job_ranges,
            tx: self
                .tx
                .as_ref()
                .expect("producer requested after flush")
                .clone(),
            buf: Vec::with_capacity(self.pos_buffer_positions.min(1 << 20)),
            cap: self.pos_buffer_positions,
            produced: 0,
        }
    }

    /// Barrier: waits until every batch has been merged and every spill file
    /// is closed. All producer buffers must have been finished and dropped.
    pub fn flush(&mut self) -> Result<()> {
        drop(self.tx.take());
        let merger = self
            .merger
            .take()
            .ok_or_else(|| anyhow!("rank-array buffers flushed twice"))?;
        self.slots = merger
            .join()
            .map_err(|_| anyhow!("the rank-array merger thread panicked"))??;
        Ok(())
    }

    /// Total rank-array values that landed in `job`.
    pub fn count(&self, job: usize) -> u64 {
        self.slots[job].count
    }

    /// Smallest value that landed in `job`, if any.
    pub fn min_value(&self, job: usize) -> Option<u64> {
        self.slots[job].min
    }

    /// Largest value that landed in `job`, if any.
    pub fn max_value(&self, job: usize) -> Option<u64> {
        self.slots[job].max
    }

    /// Total rank-array values across all jobs.
    pub fn total(&self) -> u64 {
        self.slots.iter().map(|s| s.count).sum()
    }

    /// Ascending stream of `job`'s rank-array values, duplicates preserved.
    pub fn iter_job(&self, job: usize) -> Result<RankArrayIter> {
        let mut heap = dary_heap::QuaternaryHeap::new();
        for (path, pairs) in &self.slots[job].files {
            let mut iter = RunFileIter::open(path, *pairs)?;
            if let Some(head) = iter.next() {
                heap.push(HeadTail { head, tail: iter });
            }
        }
        Ok(RankArrayIter {
            heap,
            current: None,
        })
    }

    /// Removes all spill files; call after phase B.
    pub fn delete_spills(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            for (path, _) in slot.files.drain(..) {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Could not remove spill {}", path.display()))?;
            }
        }
        Ok(())
    }
}

impl Drop for MergeBuffers {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(merger) = self.merger.take() {
            let _ = merger.join();
        }
    }
}

/// A per-thread buffer of rank-array values.
pub struct PosBuffer<'a> {
    ranges: &'a [JobRange],
    tx: Sender<Batch>,
    buf: Vec<u64>,
    cap: usize,
    produced: u64,
}

impl<'a> PosBuffer<'a> {
    /// Records one rank-array value, flushing to the merger when the buffer
    /// is full.
    #[inline]
    pub fn insert(&mut self, value: usize) -> Result<()> {
        self.buf.push(value as u64);
        self.produced += 1;
        if self.buf.len() >= self.cap {
            self.flush()?;
        }
        Ok(())
    }

    /// Sorts and hands over the buffered values; called after every
    /// sequence walk and when the buffer fills up.
    pub fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.buf.sort_unstable();

        let mut batch: Vec<(u64, u64)> = Vec::new();
        let mut batch_job = bin(self.buf[0] as usize, self.ranges);
        for &value in &self.buf {
            let job = bin(value as usize, self.ranges);
            if job != batch_job {
                self.send(batch_job, std::mem::take(&mut batch))?;
                batch_job = job;
            }
            match batch.last_mut() {
                Some((v, count)) if *v == value => *count += 1,
                _ => batch.push((value, 1)),
            }
        }
        self.send(batch_job, batch)?;
        self.buf.clear();
        Ok(())
    }

    fn send(&self, job: usize, batch: Vec<(u64, u64)>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx
            .send((job, batch))
            .map_err(|_| anyhow!("the rank-array merger terminated early"))
    }

    /// Flushes the remaining values and consumes the buffer; returns the
    /// number of values this producer contributed.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.produced)
    }
}

fn merger_loop(
    rx: Receiver<Batch>,
    jobs: usize,
    dir: PathBuf,
    thread_buffer_bytes: usize,
) -> Result<Vec<Slot>> {
    let mut slots: Vec<Slot> = (0..jobs).map(|_| Slot::default()).collect();
    for (job, batch) in rx {
        let slot = &mut slots[job];
        // the batch is sorted, so its extremes are at the ends
        let (batch_min, _) = batch[0];
        let (batch_max, _) = batch[batch.len() - 1];
        slot.min = Some(slot.min.map_or(batch_min, |m| m.min(batch_min)));
        slot.max = Some(slot.max.map_or(batch_max, |m| m.max(batch_max)));
        slot.count += batch.iter().map(|&(_, c)| c).sum::<u64>();
        slot.pending_bytes += batch.len() * core::mem::size_of::<(u64, u64)>();
        slot.pending.extend(batch);
        if slot.pending_bytes >= thread_buffer_bytes {
            spill(job, slot, &dir)?;
        }
    }
    for (job, slot) in slots.iter_mut().enumerate() {
        spill(job, slot, &dir)?;
    }
    Ok(slots)
}

/// Sorts and coalesces a slot's pending runs and writes them as one γ-coded
/// run file (gap from the previous value, then count).
fn spill(job: usize, slot: &mut Slot, dir: &Path) -> Result<()> {
    if slot.pending.is_empty() {
        return Ok(());
    }
    slot.pending.sort_unstable();
    let path = dir.join(format!("ra_{:04x}_{:06x}", job, slot.spilled));
    slot.spilled += 1;

    let file = BufWriter::with_capacity(
        1 << 16,
        File::create(&path).with_context(|| format!("Could not create spill {}", path.display()))?,
    );
    let mut stream: BitWriter = BufBitWriter::new(WordAdapter::new(file));
    let mut pairs = 0u64;
    let mut prev = 0u64;
    let mut iter = slot.pending.drain(..).peekable();
    while let Some((value, mut count)) = iter.next() {
        while let Some(&(next, next_count)) = iter.peek() {
            if next != value {
                break;
            }
            count += next_count;
            iter.next();
        }
        stream
            .write_gamma(value - prev)
            .with_context(|| format!("Could not write spill {}", path.display()))?;
        stream
            .write_gamma(count)
            .with_context(|| format!("Could not write spill {}", path.display()))?;
        prev = value;
        pairs += 1;
    }
    stream
        .flush()
        .with_context(|| format!("Could not flush spill {}", path.display()))?;
    slot.pending_bytes = 0;
    slot.files.push((path, pairs));
    Ok(())
}

/// Reads one spill run file back as an iterator of `(value, count)` pairs in
/// ascending value order.
struct RunFileIter {
    stream: BitReader,
    remaining: u64,
    prev: u64,
}

impl RunFileIter {
    fn open(path: &Path, pairs: u64) -> Result<Self> {
        let stream = <BufBitReader<NE, _>>::new(MemWordReader::new(ArcMmapHelper(Arc::new(
            MmapHelper::mmap(path, MmapFlags::TRANSPARENT_HUGE_PAGES | MmapFlags::SEQUENTIAL)
                .with_context(|| format!("Could not mmap spill {}", path.display()))?,
        ))));
        Ok(RunFileIter {
            stream,
            remaining: pairs,
            prev: 0,
        })
    }
}

impl Iterator for RunFileIter {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let gap = self.stream.read_gamma().unwrap();
        let count = self.stream.read_gamma().unwrap();
        self.prev += gap;
        Some((self.prev, count))
    }
}

/// Heap entry for the k-way merge of run files; ordered by ascending value.
struct HeadTail {
    head: (u64, u64),
    tail: RunFileIter,
}

impl PartialEq for HeadTail {
    fn eq(&self, other: &Self) -> bool {
        self.head.0 == other.head.0
    }
}

impl Eq for HeadTail {}

impl PartialOrd for HeadTail {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeadTail {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.head.0.cmp(&self.head.0)
    }
}

/// Ascending stream over one job's rank-array values; each value is yielded
/// once per insertion (duplicates preserved).
pub struct RankArrayIter {
    heap: dary_heap::QuaternaryHeap<HeadTail>,
    current: Option<(u64, u64)>,
}

impl Iterator for RankArrayIter {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        loop {
            if let Some((value, count)) = &mut self.current {
                if *count > 0 {
                    *count -= 1;
                    return Some(*value);
                }
                self.current = None;
            }
            let mut head_tail = self.heap.peek_mut()?;
            let head = match head_tail.tail.next() {
                None => PeekMut::pop(head_tail).head,
                Some(next) => std::mem::replace(&mut head_tail.head, next),
            };
            self.current = Some(head);
        }
    }
}
