/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! End-to-end merge scenarios over indexes fabricated with the naive
//! suffix-array builder.

mod common;

use anyhow::Result;
use common::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;

use rimerge::index::{check_sa_values, check_structure, RIndex, BWT_FILE, SAMPLES_FILE};
use rimerge::merge::{merge, MergeParameters};
use rimerge::rle::{meta_path, RlEncoder, RleString, SegmentMeta};
use rimerge::samples::SaSamples;

fn test_parameters(search_jobs: usize, merge_jobs: usize) -> MergeParameters {
    let mut parameters = MergeParameters::default();
    parameters
        .set_search_jobs(search_jobs)
        .set_merge_jobs(merge_jobs)
        .set_pos_buffer_size(1)
        .set_thread_buffer_size(1);
    parameters
}

/// Structural check plus the per-sequence LF walk over the sample values.
fn assert_index_consistent(dir: &Path) -> Result<RIndex> {
    assert_record_invariant(&dir.join(BWT_FILE))?;
    let index = RIndex::load(dir)?;
    let report = check_structure(&index);
    assert!(report.passed(), "structural check failed: {:?}", report);
    assert_eq!(check_sa_values(&index), 0, "sample values disagree");
    Ok(index)
}

/// Two adjacent records may share their symbol only when the first carries
/// the continuation flag.
fn assert_record_invariant(path: &Path) -> Result<()> {
    const NEXT_RECORD: u32 = 0x8000_0000;
    let bytes = std::fs::read(path)?;
    assert_eq!(bytes.len() % 4, 0);
    let records: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .collect();
    for (i, pair) in records.windows(2).enumerate() {
        let same_symbol = pair[0] & 0xFF == pair[1] & 0xFF;
        let continuation = pair[0] & NEXT_RECORD != 0;
        assert!(
            !same_symbol || continuation,
            "adjacent records {} and {} share symbol {:#04x} without continuation",
            i,
            i + 1,
            pair[0] & 0xFF
        );
    }
    Ok(())
}

#[test]
fn test_smoke() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (left, right) = (b"GATTACA".as_slice(), b"TATA".as_slice());
    write_index(&dir.path().join("a"), left)?;
    write_index(&dir.path().join("b"), right)?;

    let out = dir.path().join("merged");
    let summary = merge(
        dir.path().join("a"),
        dir.path().join("b"),
        &out,
        &test_parameters(1, 1),
    )?;
    assert_eq!(summary.size as usize, left.len() + right.len() + 2);
    assert_eq!(summary.sequences, 2);

    let merged = assert_index_consistent(&out)?;
    assert_eq!(merged.sequence(0), left);
    assert_eq!(merged.sequence(1), right);

    // the merged BWT is the BWT of the flat concatenation, up to terminator
    // substitutions
    let reference = reference_merged_bwt(left, right);
    assert_bwt_eq_mod_terminators(&merged.bwt().to_bytes(), &reference);

    // the sequence-head samples carry the tail offsets: the left tail at
    // |left|, the right tail at the end of the concatenated coordinates
    assert_eq!(merged.samples().get(0), Some(left.len() as u64));
    assert_eq!(
        merged.samples().get(1),
        Some((left.len() + right.len() + 1) as u64)
    );
    Ok(())
}

#[test]
fn test_identical_sequences() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_index(&dir.path().join("a"), b"AAAA")?;
    write_index(&dir.path().join("b"), b"AAAA")?;

    let out = dir.path().join("merged");
    merge(
        dir.path().join("a"),
        dir.path().join("b"),
        &out,
        &test_parameters(1, 1),
    )?;

    let merged = assert_index_consistent(&out)?;
    assert_eq!(merged.sequence(0), b"AAAA");
    assert_eq!(merged.sequence(1), b"AAAA");

    // the two A-runs fuse into one, followed by the two terminators
    let reference = reference_merged_bwt(b"AAAA", b"AAAA");
    assert_bwt_eq_mod_terminators(&merged.bwt().to_bytes(), &reference);
    Ok(())
}

#[test]
fn test_empty_right_is_a_no_op() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    write_index(&a, b"GATTACA")?;
    // a zero-length right index
    std::fs::create_dir_all(&b)?;
    RlEncoder::new(b.join(BWT_FILE))?.close()?;
    std::fs::write(b.join(SAMPLES_FILE), [])?;

    let out = dir.path().join("merged");
    merge(&a, &b, &out, &test_parameters(1, 1))?;

    for name in [BWT_FILE, SAMPLES_FILE] {
        assert_eq!(
            std::fs::read(a.join(name))?,
            std::fs::read(out.join(name))?,
            "{} differs",
            name
        );
    }
    assert_eq!(
        std::fs::read(meta_path(a.join(BWT_FILE)))?,
        std::fs::read(meta_path(out.join(BWT_FILE)))?
    );
    Ok(())
}

#[test]
fn test_partition_edges() -> Result<()> {
    // |left BWT| = 7, three jobs: the per-job segments must fuse into the
    // single-job result byte for byte
    let dir = tempfile::tempdir()?;
    write_index(&dir.path().join("a"), b"GATTAC")?;
    write_index(&dir.path().join("b"), b"TATA")?;

    let single = dir.path().join("single");
    let split = dir.path().join("split");
    merge(
        dir.path().join("a"),
        dir.path().join("b"),
        &single,
        &test_parameters(1, 1),
    )?;
    merge(
        dir.path().join("a"),
        dir.path().join("b"),
        &split,
        &test_parameters(1, 3),
    )?;

    // a run crossing a job boundary is stored as a continuation chain, so
    // the segments are compared by decoded content; the metadata (true run
    // counts) must be byte-identical
    assert_eq!(
        RleString::load(single.join(BWT_FILE))?.to_bytes(),
        RleString::load(split.join(BWT_FILE))?.to_bytes()
    );
    assert_eq!(
        std::fs::read(meta_path(single.join(BWT_FILE)))?,
        std::fs::read(meta_path(split.join(BWT_FILE)))?
    );
    // sample files may order duplicates differently across jobs; the
    // coalesced stores must agree
    let single_samples: Vec<_> = SaSamples::read(single.join(SAMPLES_FILE))?.iter().collect();
    let split_samples: Vec<_> = SaSamples::read(split.join(SAMPLES_FILE))?.iter().collect();
    assert_eq!(single_samples, split_samples);

    assert_index_consistent(&split)?;
    Ok(())
}

#[test]
fn test_random_robustness() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(0xB40B);
    for round in 0..3 {
        let dir = tempfile::tempdir()?;
        let seed = random_dna(&mut rng, 1000);
        let left = mutate(&mut rng, &seed, 0.15);
        let right = mutate(&mut rng, &seed, 0.15);
        write_index(&dir.path().join("a"), &left)?;
        write_index(&dir.path().join("b"), &right)?;

        let out = dir.path().join("merged");
        merge(
            dir.path().join("a"),
            dir.path().join("b"),
            &out,
            &test_parameters(2, 3),
        )?;

        let merged = assert_index_consistent(&out)?;
        assert_eq!(merged.sequence(0), left, "round {}", round);
        assert_eq!(merged.sequence(1), right, "round {}", round);

        let reference = reference_merged_bwt(&left, &right);
        assert_bwt_eq_mod_terminators(&merged.bwt().to_bytes(), &reference);
    }
    Ok(())
}

#[test]
fn test_parallel_merge_matches_sequential() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let dir = tempfile::tempdir()?;
    let left = random_dna(&mut rng, 600);
    let right = random_dna(&mut rng, 400);
    write_index(&dir.path().join("a"), &left)?;
    write_index(&dir.path().join("b"), &right)?;

    let sequential = dir.path().join("sequential");
    let parallel = dir.path().join("parallel");
    merge(
        dir.path().join("a"),
        dir.path().join("b"),
        &sequential,
        &test_parameters(1, 1),
    )?;
    merge(
        dir.path().join("a"),
        dir.path().join("b"),
        &parallel,
        &test_parameters(4, 4),
    )?;

    assert_eq!(
        RleString::load(sequential.join(BWT_FILE))?.to_bytes(),
        RleString::load(parallel.join(BWT_FILE))?.to_bytes()
    );
    assert_eq!(
        std::fs::read(meta_path(sequential.join(BWT_FILE)))?,
        std::fs::read(meta_path(parallel.join(BWT_FILE)))?
    );
    let a: Vec<_> = SaSamples::read(sequential.join(SAMPLES_FILE))?.iter().collect();
    let b: Vec<_> = SaSamples::read(parallel.join(SAMPLES_FILE))?.iter().collect();
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn test_cascaded_merge() -> Result<()> {
    // merge three collections pairwise; the intermediate index is itself a
    // valid merge input
    let dir = tempfile::tempdir()?;
    let strings: [&[u8]; 3] = [b"GATTACA", b"CATCAT", b"TAGACAT"];
    write_index(&dir.path().join("i0"), strings[0])?;
    write_index(&dir.path().join("i1"), strings[1])?;
    write_index(&dir.path().join("i2"), strings[2])?;

    let m01 = dir.path().join("m01");
    merge(
        dir.path().join("i0"),
        dir.path().join("i1"),
        &m01,
        &test_parameters(1, 2),
    )?;
    assert_index_consistent(&m01)?;

    let m012 = dir.path().join("m012");
    merge(&m01, dir.path().join("i2"), &m012, &test_parameters(2, 2))?;

    let merged = assert_index_consistent(&m012)?;
    assert_eq!(merged.sequences(), 3);
    for (i, s) in strings.iter().enumerate() {
        assert_eq!(merged.sequence(i), *s, "sequence {}", i);
    }
    Ok(())
}

#[test]
fn test_run_length_overflow() -> Result<()> {
    // a 10M-symbol run spans two records in the merged segment
    let dir = tempfile::tempdir()?;
    let a = dir.path().join("a");
    let len = 10_000_000usize;

    // BWT of A^len ⋅ 0x01 is A^len ⋅ 0x01 with SA[i] = n - 1 - i
    std::fs::create_dir_all(&a)?;
    let n = len + 1;
    let mut encoder = RlEncoder::new(a.join(BWT_FILE))?;
    encoder.append_run(b'A', len)?;
    encoder.append(rimerge::utils::DATA_TERMINATOR)?;
    encoder.close()?;
    {
        use rimerge::samples::write_sample;
        use std::io::Write;
        let mut samples = std::io::BufWriter::new(std::fs::File::create(a.join(SAMPLES_FILE))?);
        for i in [0, 1, n - 2, n - 1] {
            write_sample(&mut samples, i as u64, (n - 1 - i) as u64)?;
        }
        samples.flush()?;
    }

    write_index(&dir.path().join("b"), b"G")?;

    let out = dir.path().join("merged");
    let summary = merge(&a, dir.path().join("b"), &out, &test_parameters(1, 1))?;
    assert_eq!(summary.size as usize, n + 2);

    let meta = SegmentMeta::read(meta_path(out.join(BWT_FILE)))?;
    assert_eq!(meta.size as usize, n + 2);
    // A, G, A^(len-1), and one run of the two (equal) terminator bytes
    assert_eq!(meta.runs, 4);
    // the long A-run needs one continuation record
    assert_eq!(std::fs::metadata(out.join(BWT_FILE))?.len(), 4 * 5);

    let bwt = RleString::load(out.join(BWT_FILE))?;
    assert_eq!(bwt.len(), n + 2);

    let merged = RIndex::load(&out)?;
    let report = check_structure(&merged);
    assert!(report.passed(), "{:?}", report);
    assert_eq!(merged.sequence(1), b"G");
    Ok(())
}
