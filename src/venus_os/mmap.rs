// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Error as IoError;
use std::io::Result as IoResult;
use std::ptr::null_mut;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use crate::venus_os::descriptor::OwnedDescriptor;

/// A shared mapping of a descriptor's backing region, unmapped on drop.
pub struct MemoryMapping {
    addr: *mut libc::c_void,
    size: usize,
}

// SAFETY: the mapping is MAP_SHARED device/shm memory with a stable address; all accesses
// go through volatile or atomic operations.
unsafe impl Send for MemoryMapping {}
// SAFETY: see above.
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    /// Maps `size` bytes of `descriptor` read/write and shared.
    pub fn from_descriptor(descriptor: &OwnedDescriptor, size: usize) -> IoResult<MemoryMapping> {
        if size == 0 {
            return Err(IoError::from(std::io::ErrorKind::InvalidInput));
        }

        // SAFETY: the descriptor is valid for the duration of the call and mmap's result is
        // checked before use.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                descriptor.as_raw_descriptor(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(IoError::last_os_error());
        }

        Ok(MemoryMapping { addr, size })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Atomically loads the `u32` the guest publishes at `offset`. The offset must be
    /// 4-byte aligned and within the mapping.
    pub fn load_u32(&self, offset: usize) -> u32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.size);

        // SAFETY: bounds and alignment were checked above, and the location is only ever
        // accessed atomically.
        let value = unsafe { &*(self.as_ptr().add(offset) as *const AtomicU32) };
        value.load(Ordering::Acquire)
    }

    /// Copies `data` into the mapping at `offset`. The range must be within the mapping.
    pub fn write_slice(&self, offset: usize, data: &[u8]) -> IoResult<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or(IoError::from(std::io::ErrorKind::InvalidInput))?;
        if end > self.size {
            return Err(IoError::from(std::io::ErrorKind::UnexpectedEof));
        }

        // SAFETY: the destination range was checked against the mapping bounds and the
        // source is a valid slice.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copies `data.len()` bytes out of the mapping at `offset`.
    pub fn read_slice(&self, offset: usize, data: &mut [u8]) -> IoResult<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or(IoError::from(std::io::ErrorKind::InvalidInput))?;
        if end > self.size {
            return Err(IoError::from(std::io::ErrorKind::UnexpectedEof));
        }

        // SAFETY: the source range was checked against the mapping bounds and the
        // destination is a valid slice.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), data.as_mut_ptr(), data.len());
        }
        Ok(())
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // SAFETY: this mapping was returned by a successful mmap with this size.
        unsafe {
            libc::munmap(self.addr, self.size);
        }
    }
}
