// Copyright © 2025 Demi Marie Obenour
// Copyright © 2025 The vfio-passthrough Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Direct-map windows backed by `mmap()`.

use core::ffi::c_int;
use core::ptr::null_mut;
use std::io::{Error, ErrorKind};
use std::os::fd::{AsRawFd as _, BorrowedFd};

use libc::size_t;

/// A region of `mmap()`-allocated memory that calls `munmap()` when dropped.
/// The address space stays reserved for the lifetime of the value. Accesses
/// go through the volatile, naturally aligned helpers below since the
/// memory is usually device registers.
#[derive(Debug)]
pub struct MmapRegion {
    addr: *mut u8,
    len: size_t,
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: addr and len describe a mapping we own.
        let ret = unsafe { libc::munmap(self.addr as *mut _, self.len) };
        if ret != 0 {
            error!(
                "Could not unmap window at {:p}: {}",
                self.addr,
                Error::last_os_error()
            );
        }
    }
}
// SAFETY: the window is owned by a single region and only touched through
// volatile accesses.
unsafe impl Send for MmapRegion {}
// SAFETY: see above.
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Return the length of the region.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Create an [`MmapRegion`] using a shared `mmap` of a file descriptor.
    pub fn mmap(len: u64, prot: c_int, fd: BorrowedFd, offset: u64) -> std::io::Result<Self> {
        const BAD_OFFSET: &str = "Offset must fit in libc::off_t";
        const BAD_LENGTH: &str = "Mapping length must be non zero and fit \
in both isize and libc::size_t";
        let Ok(offset) = libc::off_t::try_from(offset) else {
            return Err(Error::new(ErrorKind::InvalidInput, BAD_OFFSET));
        };
        if len == 0 || isize::try_from(len).is_err() {
            return Err(Error::new(ErrorKind::InvalidInput, BAD_LENGTH));
        }
        let Ok(len) = libc::size_t::try_from(len) else {
            return Err(Error::new(ErrorKind::InvalidInput, BAD_LENGTH));
        };

        assert!(
            (prot & !(libc::PROT_READ | libc::PROT_WRITE)) == 0,
            "bad protection"
        );
        // SAFETY: FFI call with correct parameters.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset,
            )
        };
        if addr == libc::MAP_FAILED {
            Err(Error::last_os_error())
        } else {
            Ok(Self {
                addr: addr as _,
                len,
            })
        }
    }

    // Whether a `width` bytes access at `offset` stays in bounds and is
    // naturally aligned.
    fn check(&self, offset: usize, width: usize) -> bool {
        matches!(width, 1 | 2 | 4 | 8)
            && offset % width == 0
            && offset.checked_add(width).is_some_and(|end| end <= self.len)
    }

    /// Little-endian read of `width` bytes at `offset`, `None` when the
    /// access is out of bounds, misaligned or of an unsupported width.
    pub fn read_volatile(&self, offset: usize, width: usize) -> Option<u64> {
        if !self.check(offset, width) {
            return None;
        }
        // SAFETY: the access is in bounds and aligned, the mapping lives as
        // long as self.
        let value = unsafe {
            let p = self.addr.add(offset);
            match width {
                1 => u64::from(std::ptr::read_volatile(p)),
                2 => u64::from(u16::from_le(std::ptr::read_volatile(p as *const u16))),
                4 => u64::from(u32::from_le(std::ptr::read_volatile(p as *const u32))),
                _ => u64::from_le(std::ptr::read_volatile(p as *const u64)),
            }
        };
        Some(value)
    }

    /// Little-endian write of the low `width` bytes of `value` at `offset`.
    /// Returns false, writing nothing, when the access is rejected.
    pub fn write_volatile(&self, offset: usize, width: usize, value: u64) -> bool {
        if !self.check(offset, width) {
            return false;
        }
        // SAFETY: the access is in bounds and aligned, the mapping lives as
        // long as self.
        unsafe {
            let p = self.addr.add(offset);
            match width {
                1 => std::ptr::write_volatile(p, value as u8),
                2 => std::ptr::write_volatile(p as *mut u16, (value as u16).to_le()),
                4 => std::ptr::write_volatile(p as *mut u32, (value as u32).to_le()),
                _ => std::ptr::write_volatile(p as *mut u64, value.to_le()),
            }
        }
        true
    }
}
