/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Run-length encoded BWT segments: the packed record codec, the metadata
//! sidecar, and the segment merger that fuses runs across segment
//! boundaries.
//!
//! A segment file is a sequence of 32-bit little-endian records. Bit 31 is
//! the continuation flag, bits 30..8 the run length, bits 7..0 the symbol.
//! A run longer than [`MAX_RUN_LEN`] spans several records, all but the last
//! with the continuation flag set.

use anyhow::{bail, ensure, Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::utils::{DATA_TERMINATOR, IMPL_TERMINATOR, ALPHABET_MAX_SIZE};

mod string;
pub use string::{Accessor, RleString, RunCache, RunIter};

/// Continuation flag: the next record belongs to the same run.
pub const NEXT_RECORD: u32 = 0x8000_0000;
/// Maximum run length a single record can carry.
pub const MAX_RUN_LEN: u32 = 0x7F_FFFF;
const LENGTH_MASK: u32 = 0x7FFF_FF00;
const CHAR_MASK: u32 = 0xFF;
const CHAR_BITS: u32 = 8;

/// Extension of the metadata sidecar next to a segment file.
pub const META_EXTENSION: &str = "meta";

/// A maximal run of equal symbols in a BWT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Run {
    /// Position in the BWT of the run's first symbol.
    pub offset: usize,
    /// Number of symbols in the run; always positive.
    pub len: usize,
    /// The repeated symbol.
    pub symbol: u8,
}

impl Run {
    /// Position of the run's last symbol.
    #[inline(always)]
    pub fn end(&self) -> usize {
        self.offset + self.len - 1
    }

    /// Whether `pos` falls inside this run.
    #[inline(always)]
    pub fn contains(&self, pos: usize) -> bool {
        pos >= self.offset && pos <= self.end()
    }
}

#[inline(always)]
fn pack(c: u8, len: u32, continuation: bool) -> u32 {
    debug_assert!(len >= 1 && len <= MAX_RUN_LEN);
    (len << CHAR_BITS) | c as u32 | if continuation { NEXT_RECORD } else { 0 }
}

#[inline(always)]
fn unpack(record: u32) -> (u8, u32, bool) {
    (
        (record & CHAR_MASK) as u8,
        (record & LENGTH_MASK) >> CHAR_BITS,
        record & NEXT_RECORD != 0,
    )
}

/// Returns the metadata sidecar path of a segment file (`foo.rle` →
/// `foo.rle.meta`).
pub fn meta_path(path: impl AsRef<Path>) -> PathBuf {
    let mut os = path.as_ref().as_os_str().to_owned();
    os.push(".");
    os.push(META_EXTENSION);
    PathBuf::from(os)
}

/// The metadata sidecar of a segment: total symbols, total runs, and the
/// per-symbol breakdown of both.
#[derive(Clone)]
pub struct SegmentMeta {
    pub size: u64,
    pub runs: u64,
    pub size_per_char: Box<[u64; ALPHABET_MAX_SIZE]>,
    pub runs_per_char: Box<[u64; ALPHABET_MAX_SIZE]>,
}

impl core::fmt::Debug for SegmentMeta {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SegmentMeta")
            .field("size", &self.size)
            .field("runs", &self.runs)
            .finish()
    }
}

impl Default for SegmentMeta {
    fn default() -> Self {
        SegmentMeta {
            size: 0,
            runs: 0,
            size_per_char: Box::new([0; ALPHABET_MAX_SIZE]),
            runs_per_char: Box::new([0; ALPHABET_MAX_SIZE]),
        }
    }
}

impl SegmentMeta {
    /// Reads a sidecar file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = BufReader::new(
            File::open(path)
                .with_context(|| format!("Could not open metadata {}", path.display()))?,
        );
        let mut meta = SegmentMeta::default();
        meta.size = read_u64(&mut reader, path)?;
        meta.runs = read_u64(&mut reader, path)?;
        for c in 0..ALPHABET_MAX_SIZE {
            meta.size_per_char[c] = read_u64(&mut reader, path)?;
        }
        for c in 0..ALPHABET_MAX_SIZE {
            meta.runs_per_char[c] = read_u64(&mut reader, path)?;
        }
        meta.check(path)?;
        Ok(meta)
    }

    /// Writes the sidecar file.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(
            File::create(path)
                .with_context(|| format!("Could not create metadata {}", path.display()))?,
        );
        writer.write_all(&self.size.to_le_bytes())?;
        writer.write_all(&self.runs.to_le_bytes())?;
        for c in 0..ALPHABET_MAX_SIZE {
            writer.write_all(&self.size_per_char[c].to_le_bytes())?;
        }
        for c in 0..ALPHABET_MAX_SIZE {
            writer.write_all(&self.runs_per_char[c].to_le_bytes())?;
        }
        writer
            .flush()
            .with_context(|| format!("Could not write metadata {}", path.display()))
    }

    /// Checks the internal consistency of the per-symbol tallies.
    pub fn check(&self, path: &Path) -> Result<()> {
        ensure!(
            self.size == self.size_per_char.iter().sum::<u64>(),
            "Metadata {}: size does not match per-symbol sizes",
            path.display()
        );
        ensure!(
            self.runs == self.runs_per_char.iter().sum::<u64>(),
            "Metadata {}: runs do not match per-symbol runs",
            path.display()
        );
        Ok(())
    }
}

fn read_u64(reader: &mut impl Read, path: &Path) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .with_context(|| format!("Truncated metadata {}", path.display()))?;
    Ok(u64::from_le_bytes(buf))
}

/// Streaming run-length encoder for one segment file.
///
/// Symbols are appended one at a time (or run at a time); closing the
/// encoder flushes the pending run and writes the metadata sidecar.
///
/// A `0x00` symbol is never written: every appended zero is replaced by
/// [`DATA_TERMINATOR`].
pub struct RlEncoder {
    path: PathBuf,
    writer: BufWriter<File>,
    meta: SegmentMeta,
    curr: Option<(u8, u64)>,
}

impl RlEncoder {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let writer = BufWriter::new(
            File::create(&path)
                .with_context(|| format!("Could not create segment {}", path.display()))?,
        );
        Ok(RlEncoder {
            path,
            writer,
            meta: SegmentMeta::default(),
            curr: None,
        })
    }

    /// Appends one symbol, extending the current run or flushing it and
    /// starting a new one.
    pub fn append(&mut self, c: u8) -> Result<()> {
        let c = if c == IMPL_TERMINATOR { DATA_TERMINATOR } else { c };
        self.meta.size += 1;
        self.meta.size_per_char[c as usize] += 1;
        match self.curr {
            Some((curr, ref mut len)) if curr == c => *len += 1,
            Some((curr, len)) => {
                self.write_run(curr, len)?;
                self.meta.runs += 1;
                self.meta.runs_per_char[c as usize] += 1;
                self.curr = Some((c, 1));
            }
            None => {
                self.meta.runs += 1;
                self.meta.runs_per_char[c as usize] += 1;
                self.curr = Some((c, 1));
            }
        }
        Ok(())
    }

    /// Appends `len` copies of `c`.
    pub fn append_run(&mut self, c: u8, len: usize) -> Result<()> {
        for _ in 0..len {
            self.append(c)?;
        }
        Ok(())
    }

    fn write_run(&mut self, c: u8, mut len: u64) -> Result<()> {
        while len > MAX_RUN_LEN as u64 {
            self.writer
                .write_all(&pack(c, MAX_RUN_LEN, true).to_le_bytes())?;
            len -= MAX_RUN_LEN as u64;
        }
        self.writer
            .write_all(&pack(c, len as u32, false).to_le_bytes())
            .with_context(|| format!("Could not write segment {}", self.path.display()))
    }

    /// Flushes the pending run, writes the metadata sidecar, and returns the
    /// metadata.
    pub fn close(mut self) -> Result<SegmentMeta> {
        if let Some((c, len)) = self.curr.take() {
            self.write_run(c, len)?;
        }
        self.writer
            .flush()
            .with_context(|| format!("Could not flush segment {}", self.path.display()))?;
        self.meta.write(meta_path(&self.path))?;
        Ok(self.meta)
    }

    /// Number of symbols appended so far.
    pub fn size(&self) -> u64 {
        self.meta.size
    }
}

/// Streaming decoder yielding one [`Run`] at a time; continuation records
/// are accumulated into their run before it is returned.
pub struct RlDecoder {
    path: PathBuf,
    reader: BufReader<File>,
    meta: SegmentMeta,
    runs_served: u64,
    offset: usize,
}

impl RlDecoder {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let meta = SegmentMeta::read(meta_path(&path))?;
        let reader = BufReader::new(
            File::open(&path)
                .with_context(|| format!("Could not open segment {}", path.display()))?,
        );
        Ok(RlDecoder {
            path,
            reader,
            meta,
            runs_served: 0,
            offset: 0,
        })
    }

    pub fn metadata(&self) -> &SegmentMeta {
        &self.meta
    }

    fn read_record(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.reader.read_exact(&mut buf).with_context(|| {
            format!(
                "Truncated segment {}: metadata promises more runs",
                self.path.display()
            )
        })?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Returns the next run, or `None` when all runs promised by the
    /// metadata have been served.
    pub fn next_run(&mut self) -> Result<Option<Run>> {
        if self.runs_served >= self.meta.runs {
            return Ok(None);
        }
        let (symbol, mut len, mut continuation) = unpack(self.read_record()?);
        let mut length = len as usize;
        while continuation {
            let (c, l, cont) = unpack(self.read_record()?);
            ensure!(
                c == symbol,
                "Malformed segment {}: continuation record changes symbol",
                self.path.display()
            );
            len = l;
            length += len as usize;
            continuation = cont;
        }
        if length == 0 {
            bail!(
                "Malformed segment {}: zero-length run",
                self.path.display()
            );
        }
        let run = Run {
            offset: self.offset,
            len: length,
            symbol,
        };
        self.offset += length;
        self.runs_served += 1;
        Ok(Some(run))
    }

    /// Checks that the decoded totals match the metadata; call after the
    /// last run.
    pub fn check_totals(&self) -> Result<()> {
        ensure!(
            self.offset as u64 == self.meta.size && self.runs_served == self.meta.runs,
            "Segment {} decodes to {} symbols in {} runs, metadata promises {} in {}",
            self.path.display(),
            self.offset,
            self.runs_served,
            self.meta.size,
            self.meta.runs
        );
        Ok(())
    }
}

/// Fuses an ordered list of closed segment files into one segment whose
/// decoded stream is the concatenation of the parts.
///
/// When the last run of a part and the first run of the next share their
/// symbol, the boundary record is rewritten with the continuation flag so
/// the decoder sees a single run; the merged metadata drops one run per
/// fusion.
pub struct SegmentMerger {
    out_path: PathBuf,
}

impl SegmentMerger {
    pub fn new(out_path: impl AsRef<Path>) -> Self {
        SegmentMerger {
            out_path: out_path.as_ref().to_owned(),
        }
    }

    /// Concatenates `parts` (in order) into the output segment, writing its
    /// metadata sidecar, and returns the merged metadata. Empty parts are
    /// skipped.
    pub fn merge(&self, parts: &[PathBuf]) -> Result<SegmentMeta> {
        let mut metas = Vec::with_capacity(parts.len());
        for part in parts {
            metas.push(SegmentMeta::read(meta_path(part))?);
        }

        let mut out = File::create(&self.out_path)
            .with_context(|| format!("Could not create {}", self.out_path.display()))?;
        let mut merged = SegmentMeta::default();
        // last record written so far, if any
        let mut last_record: Option<u32> = None;
        let mut fusions = 0u64;

        for (part, meta) in parts.iter().zip(&metas) {
            if meta.size == 0 {
                continue;
            }
            merged.size += meta.size;
            merged.runs += meta.runs;
            for c in 0..ALPHABET_MAX_SIZE {
                merged.size_per_char[c] += meta.size_per_char[c];
                merged.runs_per_char[c] += meta.runs_per_char[c];
            }

            if let Some(last) = last_record {
                let first = first_record(part)?;
                let (first_char, _, _) = unpack(first);
                let (last_char, _, _) = unpack(last);
                if first_char == last_char {
                    // fuse: rewrite the last record with the continuation flag
                    merged.runs -= 1;
                    merged.runs_per_char[last_char as usize] -= 1;
                    fusions += 1;
                    out.seek(SeekFrom::End(-4))?;
                    out.write_all(&(last | NEXT_RECORD).to_le_bytes())?;
                    out.seek(SeekFrom::End(0))?;
                }
            }

            let mut src = File::open(part)
                .with_context(|| format!("Could not open segment part {}", part.display()))?;
            std::io::copy(&mut src, &mut out)
                .with_context(|| format!("Could not append {}", part.display()))?;
            last_record = Some(self.tail_record(part)?);
        }

        out.flush()?;
        merged.write(meta_path(&self.out_path))?;
        log::debug!(
            "Fused {} segment parts into {} ({} boundary fusions, {} runs)",
            parts.len(),
            self.out_path.display(),
            fusions,
            merged.runs
        );
        Ok(merged)
    }

    fn tail_record(&self, part: &Path) -> Result<u32> {
        let mut file = File::open(part)?;
        file.seek(SeekFrom::End(-4))
            .with_context(|| format!("Segment part {} is too short", part.display()))?;
        let mut buf = [0u8; 4];
        file.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

fn first_record(part: &Path) -> Result<u32> {
    let mut file = File::open(part)
        .with_context(|| format!("Could not open segment part {}", part.display()))?;
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)
        .with_context(|| format!("Segment part {} is too short", part.display()))?;
    Ok(u32::from_le_bytes(buf))
}
