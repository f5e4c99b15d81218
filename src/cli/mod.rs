/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The `rimerge` command-line interface: merge two indexes, check an index,
//! print its statistics.

use anyhow::Result;
use clap::{Parser, Subcommand};

pub mod check;
pub mod merge;
pub mod rle;
pub mod stats;

/// Initializes `env_logger` from the environment, defaulting to `info`.
pub fn init_env_logger() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()?;
    Ok(())
}

#[derive(Subcommand, Debug)]
pub enum SubCommands {
    Merge(merge::CliArgs),
    Check(check::CliArgs),
    Stats(stats::CliArgs),
    Rle(rle::CliArgs),
}

#[derive(Parser, Debug)]
#[command(name = "rimerge", version)]
/// Tools to merge r-indexes (run-length encoded BWTs with suffix-array
/// samples) and to inspect the results.
pub struct Cli {
    #[command(subcommand)]
    pub command: SubCommands,
}

/// The entry point of the command-line interface.
pub fn cli_main<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let start = std::time::Instant::now();
    let cli = Cli::parse_from(args);
    match cli.command {
        SubCommands::Merge(args) => merge::main(args)?,
        SubCommands::Check(args) => check::main(args)?,
        SubCommands::Stats(args) => stats::main(args)?,
        SubCommands::Rle(args) => rle::main(args)?,
    }
    log::info!("The command took {:.2} s", start.elapsed().as_secs_f64());
    Ok(())
}
