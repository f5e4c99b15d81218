/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Shared test fixtures: a naive suffix-array construction used to build
//! input indexes on disk and reference answers for merged ones.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::Rng;
use std::io::{BufWriter, Write};
use std::path::Path;

use rimerge::index::{BWT_FILE, SAMPLES_FILE};
use rimerge::rle::RlEncoder;
use rimerge::samples::write_sample;
use rimerge::utils::{DATA_TERMINATOR, STRING_TERMINATOR};

/// Naive suffix array: the text must end with a unique smallest byte.
pub fn suffix_array(text: &[u8]) -> Vec<usize> {
    let mut sa: Vec<usize> = (0..text.len()).collect();
    sa.sort_by(|&a, &b| text[a..].cmp(&text[b..]));
    sa
}

/// BWT from a suffix array, with the usual wrap-around for the first
/// position.
pub fn bwt_from_sa(text: &[u8], sa: &[usize]) -> Vec<u8> {
    sa.iter()
        .map(|&p| if p == 0 { text[text.len() - 1] } else { text[p - 1] })
        .collect()
}

/// Writes an r-index for the single string `s` (without terminator) into
/// `dir`: the BWT of `s ⋅ 0x01` plus samples at the sequence head, the
/// second position, the last position, and every run boundary.
pub fn write_index(dir: &Path, s: &[u8]) -> Result<()> {
    let mut text = s.to_vec();
    text.push(DATA_TERMINATOR);
    let sa = suffix_array(&text);
    let bwt = bwt_from_sa(&text, &sa);
    write_index_from_bwt(dir, &bwt, &sa)
}

/// Writes an index from an explicit BWT and per-position SA values.
pub fn write_index_from_bwt(dir: &Path, bwt: &[u8], sa: &[usize]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut encoder = RlEncoder::new(dir.join(BWT_FILE))?;
    let mut samples = BufWriter::new(std::fs::File::create(dir.join(SAMPLES_FILE))?);
    let n = bwt.len();
    for i in 0..n {
        let boundary = i == 0
            || i == 1
            || i == n - 1
            || bwt[i] != bwt[i - 1]
            || bwt[i] != bwt[i + 1];
        if boundary {
            write_sample(&mut samples, i as u64, sa[i] as u64)?;
        }
        encoder.append(bwt[i])?;
    }
    encoder.close()?;
    samples.flush()?;
    Ok(())
}

/// The flat-text equivalent of merging `left` then `right`: the reference
/// BWT is built over `right ⋅ 0x03 ⋅ left ⋅ 0x01` (the right collection's
/// sequences get identifiers after the left ones, which in flat form puts
/// the right text first).
pub fn reference_merged_bwt(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut text = right.to_vec();
    text.push(STRING_TERMINATOR);
    text.extend_from_slice(left);
    text.push(DATA_TERMINATOR);
    let sa = suffix_array(&text);
    bwt_from_sa(&text, &sa)
}

/// Asserts that a merged BWT equals the reference up to terminator
/// substitutions (the merge emits each input's own terminator bytes).
pub fn assert_bwt_eq_mod_terminators(merged: &[u8], reference: &[u8]) {
    assert_eq!(merged.len(), reference.len(), "BWT length mismatch");
    for (i, (&m, &r)) in merged.iter().zip(reference).enumerate() {
        let both_terminators = rimerge::utils::is_terminator(m) && rimerge::utils::is_terminator(r);
        assert!(
            m == r || both_terminators,
            "BWT mismatch at {}: {:#04x} vs reference {:#04x}",
            i,
            m,
            r
        );
    }
}

/// A random string over `ACGTN` of the given length.
pub fn random_dna(rng: &mut StdRng, len: usize) -> Vec<u8> {
    const DICT: &[u8] = b"ACGTN";
    (0..len).map(|_| DICT[rng.random_range(0..DICT.len())]).collect()
}

/// A copy of `seed` with each position resampled with probability
/// `error_rate`.
pub fn mutate(rng: &mut StdRng, seed: &[u8], error_rate: f64) -> Vec<u8> {
    const DICT: &[u8] = b"ACGTN";
    seed.iter()
        .map(|&c| {
            if rng.random::<f64>() < error_rate {
                DICT[rng.random_range(0..DICT.len())]
            } else {
                c
            }
        })
        .collect()
}
