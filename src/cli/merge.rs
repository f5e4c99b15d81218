/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use log::{error, info};
use std::path::{Path, PathBuf};

use crate::index::{check_structure, RIndex};
use crate::merge::{merge, MergeParameters};

#[derive(Parser, Debug)]
#[command(name = "merge", about = "Merges two r-indexes into one.", long_about = None)]
pub struct CliArgs {
    /// Directory of the left index.
    #[arg(short = 'a', long = "aprefix")]
    pub left: PathBuf,

    /// Directory of the right index.
    #[arg(short = 'b', long = "bprefix")]
    pub right: PathBuf,

    /// Output directory for the merged index.
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,

    /// Number of threads building the rank array.
    #[arg(short = 'j', long = "search-jobs")]
    pub search_jobs: Option<usize>,

    /// Number of interleave jobs (and threads).
    #[arg(long = "merge-jobs")]
    pub merge_jobs: Option<usize>,

    /// Per-thread position buffer, in megabytes.
    #[arg(long = "pos-buffer")]
    pub pos_buffer: Option<usize>,

    /// Per-job spill buffer, in megabytes.
    #[arg(long = "thread-buffer")]
    pub thread_buffer: Option<usize>,

    /// Directory for spill and scratch files (overrides RIMERGE_TMPDIR).
    #[arg(long = "tmp-dir")]
    pub tmp_dir: Option<PathBuf>,

    /// Configuration file accepting the long option names as `key = value`
    /// lines; explicit flags win.
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Check the structure of the merged index before exiting.
    #[arg(short = 'c', long = "check", default_value_t = false)]
    pub check: bool,
}

/// Applies a `key = value` configuration file to the parameters.
fn apply_config(parameters: &mut MergeParameters, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read configuration file {}", path.display()))?;
    for (number, line) in content.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=').or_else(|| line.split_once(' ')) else {
            bail!(
                "{}:{}: expected `key = value`, got {:?}",
                path.display(),
                number + 1,
                line
            );
        };
        let (key, value) = (key.trim(), value.trim());
        let parse = |value: &str| -> Result<usize> {
            value.parse().with_context(|| {
                format!("{}:{}: invalid value for {}", path.display(), number + 1, key)
            })
        };
        match key {
            "search-jobs" => {
                parameters.set_search_jobs(parse(value)?);
            }
            "merge-jobs" => {
                parameters.set_merge_jobs(parse(value)?);
            }
            "pos-buffer" => {
                parameters.set_pos_buffer_size(parse(value)?);
            }
            "thread-buffer" => {
                parameters.set_thread_buffer_size(parse(value)?);
            }
            "tmp-dir" => {
                parameters.set_temp_dir(value);
            }
            _ => bail!(
                "{}:{}: unknown configuration key {:?}",
                path.display(),
                number + 1,
                key
            ),
        }
    }
    Ok(())
}

pub fn main(args: CliArgs) -> Result<()> {
    let mut parameters = MergeParameters::default();
    if let Some(config) = &args.config {
        apply_config(&mut parameters, config)?;
    }
    if let Some(jobs) = args.search_jobs {
        parameters.set_search_jobs(jobs);
    }
    if let Some(jobs) = args.merge_jobs {
        parameters.set_merge_jobs(jobs);
    }
    if let Some(megabytes) = args.pos_buffer {
        parameters.set_pos_buffer_size(megabytes);
    }
    if let Some(megabytes) = args.thread_buffer {
        parameters.set_thread_buffer_size(megabytes);
    }
    if let Some(dir) = &args.tmp_dir {
        parameters.set_temp_dir(dir);
    }

    info!("A: {}", args.left.display());
    info!("B: {}", args.right.display());
    let summary = merge(&args.left, &args.right, &args.output, &parameters)?;

    if args.check {
        info!("Checking the merged index");
        let merged = RIndex::load(&args.output)?;
        let report = check_structure(&merged);
        if !report.passed() {
            error!(
                "Structural check failed: {} missing, {} invalid, {} unnecessary samples",
                report.missing.len(),
                report.invalid.len(),
                report.unnecessary.len()
            );
            bail!("the merged index failed the structural check");
        }
        info!("Structural check passed");
    }

    ensure!(summary.size > 0, "the merged index is empty");
    info!("Done");
    Ok(())
}
