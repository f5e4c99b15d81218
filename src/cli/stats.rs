/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use crate::index::RIndex;

#[derive(Parser, Debug)]
#[command(name = "stats", about = "Prints the vital statistics of an r-index.", long_about = None)]
pub struct CliArgs {
    /// Directory of the index.
    pub index: PathBuf,
}

pub fn main(args: CliArgs) -> Result<()> {
    let index = RIndex::load(&args.index)?;
    println!("size:      {}", index.len());
    println!("runs:      {}", index.runs());
    println!("sequences: {}", index.sequences());
    println!("sigma:     {}", index.sigma());
    println!("samples:   {}", index.samples().len());
    println!(
        "n/r:       {:.4}",
        index.len() as f64 / index.runs() as f64
    );
    Ok(())
}
