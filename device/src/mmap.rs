// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CPU mappings of MMAP buffer planes.

use core::slice;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::mman;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlaneMappingError {
    #[error("planes of size 0 cannot be mapped")]
    ZeroSize,
    #[error("mmap call returned error: {0}")]
    Mmap(#[from] Errno),
}

/// A read-write CPU mapping of one plane of a device buffer.
///
/// The plane is unmapped when this object is dropped, so the memory can never be accessed after
/// being unmapped, nor unmapped twice.
pub struct PlaneMapping {
    // A mapping remains valid until we munmap it, that is, until the PlaneMapping object is
    // deleted. Hence the static lifetime.
    data: &'static mut [u8],
}

impl PlaneMapping {
    /// Map `length` bytes of `fd` starting at `offset`.
    pub fn new(fd: impl AsFd, offset: u32, length: u32) -> Result<Self, PlaneMappingError> {
        let size = NonZeroUsize::new(length as usize).ok_or(PlaneMappingError::ZeroSize)?;

        // SAFETY: the memory is shared with the device but only ever accessed through the slice
        // built below, which lives exactly as long as the mapping.
        let data = unsafe {
            mman::mmap(
                None,
                size,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )?
        };

        Ok(Self {
            // SAFETY: `data` is non-null and obtained through a `mmap` of size `size`.
            data: unsafe { slice::from_raw_parts_mut(data.as_ptr().cast(), size.into()) },
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Drop for PlaneMapping {
    fn drop(&mut self) {
        // Safe because the pointer and length were constructed in mmap() and
        // are always valid.
        unsafe {
            mman::munmap(
                NonNull::new_unchecked(self.data.as_mut_ptr().cast()),
                self.data.len(),
            )
        }
        .unwrap_or_else(|e| {
            log::error!("error while unmapping buffer plane: {:#}", e);
        });
    }
}

impl AsRef<[u8]> for PlaneMapping {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

impl AsMut<[u8]> for PlaneMapping {
    fn as_mut(&mut self) -> &mut [u8] {
        self.data
    }
}
