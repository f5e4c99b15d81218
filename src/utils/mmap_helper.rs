/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::{Context, Result};
use core::fmt::Debug;
use mmap_rs::{Mmap, MmapFlags};
use std::{mem::size_of, path::Path, sync::Arc};

/// Helper struct providing convenience methods and type-based [`AsRef`]
/// access to a read-only [`Mmap`] instance.
///
/// The parameter `W` defines the type of the slice used to access the
/// mapping. If the length of the file is not a multiple of the size of `W`,
/// the file is silently zero-extended to the smallest length that is a
/// multiple of the size of `W`.
///
/// If you need a clonable version of this structure, consider using
/// [`ArcMmapHelper`].
pub struct MmapHelper<W> {
    /// The underlying memory mapping.
    mmap: Mmap,
    /// The length of the mapping in `W`'s.
    len: usize,
    /// The length of the backing file in bytes (the mapping may be longer).
    file_len: usize,
    _marker: core::marker::PhantomData<W>,
}

impl<W: Debug> Debug for MmapHelper<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmapHelper")
            .field("mmap", &self.mmap.as_ptr())
            .field("len", &self.len)
            .finish()
    }
}

impl<W> MmapHelper<W> {
    /// Returns the size of the memory mapping in `W`'s.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the memory mapping is empty.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maps a file into memory (read-only).
    ///
    /// # Arguments
    /// - `path`: The path to the file to be memory mapped.
    /// - `flags`: The flags to be used for the mmap.
    pub fn mmap(path: impl AsRef<Path>, flags: MmapFlags) -> Result<Self> {
        let path = path.as_ref();
        let file_len: usize = path
            .metadata()
            .with_context(|| format!("Cannot stat {}", path.display()))?
            .len()
            .try_into()
            .with_context(|| "Cannot convert file length to usize")?;
        // Align to a multiple of size_of::<W>
        let mmap_len = file_len.div_ceil(size_of::<W>()) * size_of::<W>();

        let file =
            std::fs::File::open(path).with_context(|| "Cannot open file for MmapHelper")?;

        let mmap = unsafe {
            // Length must be > 0, or we get a panic.
            mmap_rs::MmapOptions::new(mmap_len.max(size_of::<W>()))
                .with_context(|| format!("Cannot initialize mmap of size {mmap_len}"))?
                .with_flags(flags)
                .with_file(&file, 0)
                .map()
                .with_context(|| format!("Cannot mmap {} (size {})", path.display(), mmap_len))?
        };

        Ok(Self {
            len: mmap_len / size_of::<W>(),
            file_len,
            mmap,
            _marker: core::marker::PhantomData,
        })
    }

    /// Returns the mapping as a byte slice, truncated to the actual file
    /// content (the mapping itself may carry zero padding).
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr(), self.file_len) }
    }
}

impl<W> AsRef<[W]> for MmapHelper<W> {
    fn as_ref(&self) -> &[W] {
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr() as *const W, self.len) }
    }
}

/// A clonable version of a read-only [`MmapHelper`].
///
/// This newtype contains a read-only [`MmapHelper`] wrapped in an [`Arc`],
/// making it possible to clone it.
#[derive(Clone)]
pub struct ArcMmapHelper<W>(pub Arc<MmapHelper<W>>);

impl<W: Debug> Debug for ArcMmapHelper<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArcMmapHelper")
            .field("mmap", &self.0.mmap.as_ptr())
            .field("len", &self.0.len)
            .finish()
    }
}

impl<W> AsRef<[W]> for ArcMmapHelper<W> {
    fn as_ref(&self) -> &[W] {
        unsafe { std::slice::from_raw_parts(self.0.mmap.as_ptr() as *const W, self.0.len) }
    }
}
