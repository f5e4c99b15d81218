/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use mmap_rs::MmapFlags;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::rle::{RlDecoder, RlEncoder};
use crate::utils::{MmapHelper, STRING_TERMINATOR};

#[derive(Parser, Debug)]
#[command(
    name = "rle",
    about = "Run-length encodes a plain BWT file, or decodes a segment back to bytes.",
    long_about = None
)]
pub struct CliArgs {
    /// Plain BWT file to encode; writes `<input>.rle` plus its metadata.
    #[arg(short = 'i', long = "input", conflicts_with = "decode")]
    pub input: Option<PathBuf>,

    /// Segment file to decode; writes `<input>.ext`.
    #[arg(short = 'd', long = "decode")]
    pub decode: Option<PathBuf>,
}

pub fn main(args: CliArgs) -> Result<()> {
    if let Some(path) = &args.input {
        info!("Input: {}", path.display());
        info!("Encoding RLE");
        let bwt = MmapHelper::<u8>::mmap(path, MmapFlags::SEQUENTIAL)?;
        let mut out_path = path.as_os_str().to_owned();
        out_path.push(".rle");
        let mut encoder = RlEncoder::new(PathBuf::from(out_path))?;
        for &c in bwt.as_bytes() {
            // plain BWT constructors mark the end of a string with a zero
            encoder.append(if c == 0 { STRING_TERMINATOR } else { c })?;
        }
        let meta = encoder.close()?;
        info!("Encoded {} symbols in {} runs", meta.size, meta.runs);
        Ok(())
    } else if let Some(path) = &args.decode {
        info!("Input: {}", path.display());
        info!("Decoding RLE");
        let mut decoder = RlDecoder::new(path)?;
        let mut out_path = path.as_os_str().to_owned();
        out_path.push(".ext");
        let out_path = PathBuf::from(out_path);
        let mut out = BufWriter::new(
            std::fs::File::create(&out_path)
                .with_context(|| format!("Could not create {}", out_path.display()))?,
        );
        while let Some(run) = decoder.next_run()? {
            for _ in 0..run.len {
                out.write_all(&[run.symbol])?;
            }
        }
        decoder.check_totals()?;
        out.flush()?;
        Ok(())
    } else {
        bail!("specify --input or --decode");
    }
}
