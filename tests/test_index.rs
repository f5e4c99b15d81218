/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Loading an index from its files and navigating it.

mod common;

use anyhow::Result;
use common::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use rimerge::index::{check_sa_values, check_structure, RIndex};
use rimerge::utils::DATA_TERMINATOR;

#[test]
fn test_load_and_extract() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let s = b"GATTACAT";
    write_index(dir.path(), s)?;

    let index = RIndex::load(dir.path())?;
    assert_eq!(index.len(), s.len() + 1);
    assert_eq!(index.sequences(), 1);
    assert_eq!(index.sequence(0), s);

    let report = check_structure(&index);
    assert!(report.passed(), "{:?}", report);
    assert_eq!(check_sa_values(&index), 0);
    Ok(())
}

#[test]
fn test_lf_fl_inverse() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut rng = StdRng::seed_from_u64(99);
    let s = random_dna(&mut rng, 500);
    write_index(dir.path(), &s)?;

    let index = RIndex::load(dir.path())?;
    let mut seen = vec![false; index.len()];
    for i in 0..index.len() {
        let j = index.lf(i);
        assert!(!seen[j], "LF is not injective at {}", i);
        seen[j] = true;
        assert_eq!(index.fl(j), i, "FL does not invert LF at {}", i);
    }
    Ok(())
}

#[test]
fn test_lf_walk_matches_text() -> Result<()> {
    // walking LF from the sequence head spells the text backwards
    let dir = tempfile::tempdir()?;
    let s = b"ACCTGAGTTA";
    write_index(dir.path(), s)?;
    let index = RIndex::load(dir.path())?;

    let mut collected = Vec::new();
    let mut pos = 0;
    loop {
        let c = index.bwt().at(pos);
        if c == DATA_TERMINATOR {
            break;
        }
        collected.push(c);
        pos = index.lf(pos);
    }
    collected.reverse();
    assert_eq!(collected, s);
    Ok(())
}

#[test]
fn test_lf_range() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let s = b"GATTACA";
    write_index(dir.path(), s)?;
    let index = RIndex::load(dir.path())?;

    // backward search for "TA": all suffixes starting with 'A', then
    // prepend 'T'
    let full = index.full_range();
    let a_range = index.lf_range(full, b'A').unwrap();
    assert_eq!(a_range.1 - a_range.0 + 1, 3);
    let ta_range = index.lf_range(a_range, b'T').unwrap();
    assert_eq!(ta_range.1 - ta_range.0 + 1, 1);

    // no occurrence of 'N'
    assert_eq!(index.lf_range(full, b'N'), None);
    Ok(())
}
