// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::ffi::CString;
use std::io::Error as IoError;
use std::io::Result as IoResult;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

use crate::venus_os::descriptor::OwnedDescriptor;

/// An anonymous shared memory region.
pub struct SharedMemory {
    descriptor: OwnedDescriptor,
    size: u64,
}

impl SharedMemory {
    /// Creates a new shared memory region of the given size.
    ///
    /// `debug_name` is purely for debugging purposes. It does not need to be unique, and it
    /// does not affect any non-debugging related properties of the region.
    pub fn new(debug_name: &str, size: u64) -> IoResult<SharedMemory> {
        let name = CString::new(debug_name)
            .map_err(|_| IoError::from(std::io::ErrorKind::InvalidInput))?;

        // SAFETY: the name is a valid NUL-terminated string and the result is checked.
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(IoError::last_os_error());
        }

        // SAFETY: memfd_create just returned this descriptor, so it is valid and unowned.
        let descriptor: OwnedDescriptor = unsafe { OwnedFd::from_raw_fd(raw) }.into();

        // SAFETY: the descriptor is valid and the result is checked.
        let ret = unsafe { libc::ftruncate(descriptor.as_raw_descriptor(), size as libc::off_t) };
        if ret < 0 {
            return Err(IoError::last_os_error());
        }

        Ok(SharedMemory { descriptor, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl From<SharedMemory> for OwnedDescriptor {
    fn from(shm: SharedMemory) -> OwnedDescriptor {
        shm.descriptor
    }
}
