/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

#![doc = include_str!("../README.md")]
#![deny(unstable_features)]
#![deny(trivial_casts)]
#![deny(unconditional_recursion)]
#![deny(clippy::empty_loop)]
#![deny(unreachable_code)]
#![deny(unreachable_patterns)]
#![deny(unused_macro_rules)]
#![deny(unused_doc_comments)]

pub mod alphabet;
pub mod bits;
#[cfg(feature = "cli")]
pub mod cli;
pub mod index;
pub mod merge;
pub mod rle;
pub mod samples;
pub mod utils;

/// Prelude module to import everything from this crate
pub mod prelude {
    pub use crate::alphabet::*;
    pub use crate::bits::*;
    pub use crate::index::*;
    pub use crate::merge::*;
    pub use crate::rle::*;
    pub use crate::samples::*;
    pub use crate::utils::*;
}
