/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::{bail, Result};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

use crate::index::{check_sa_values, check_structure, RIndex};

#[derive(Parser, Debug)]
#[command(
    name = "check",
    about = "Checks the sample structure (and optionally the sample values) of an r-index.",
    long_about = None
)]
pub struct CliArgs {
    /// Directory of the index to check.
    pub index: PathBuf,

    /// Also walk every sequence and verify the sample values.
    #[arg(long = "sa-values", default_value_t = false)]
    pub sa_values: bool,
}

pub fn main(args: CliArgs) -> Result<()> {
    info!("Reading the index from {}", args.index.display());
    let index = RIndex::load(&args.index)?;
    info!(
        "Index: size {}, sequences {}, runs {}",
        index.len(),
        index.sequences(),
        index.runs()
    );

    let report = check_structure(&index);
    info!(
        "Structure: {} missing, {} invalid, {} unnecessary samples",
        report.missing.len(),
        report.invalid.len(),
        report.unnecessary.len()
    );
    for position in report.missing.iter().take(10) {
        error!("Missing sample at position {}", position);
    }
    for position in report.invalid.iter().take(10) {
        error!("Invalid sample value at position {}", position);
    }
    if !report.passed() {
        bail!("the index failed the structural check");
    }

    if args.sa_values {
        let errors = check_sa_values(&index);
        if errors > 0 {
            bail!("{} sample values disagree with the LF walk", errors);
        }
        info!("All sample values agree with the LF walk");
    }

    info!("Check passed");
    Ok(())
}
