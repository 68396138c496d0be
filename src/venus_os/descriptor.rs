// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Error;
use std::io::ErrorKind;
use std::io::Result;
use std::os::fd::OwnedFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::IntoRawFd;
use std::os::unix::io::RawFd;

use nix::unistd::lseek;
use nix::unistd::Whence;

pub type RawDescriptor = RawFd;

/// An owned file descriptor, closed exactly once when dropped.
///
/// Every fd that crosses the renderer boundary is held in one of these; any path that
/// shares an fd beyond a single call dups it first so each copy has exactly one owner.
pub struct OwnedDescriptor {
    owned: OwnedFd,
}

impl OwnedDescriptor {
    /// Duplicates the descriptor. Both copies refer to the same open file description and
    /// are closed independently.
    pub fn try_clone(&self) -> Result<OwnedDescriptor> {
        let clone = self.owned.try_clone()?;
        Ok(OwnedDescriptor { owned: clone })
    }

    /// Probes the seekable size of the backing region, as used to sanity-check an
    /// exported dma-buf against the blob size it is supposed to cover.
    pub fn region_size(&self) -> Result<u64> {
        let seek_size = lseek(self.as_raw_descriptor(), 0, Whence::SeekEnd)?;
        seek_size
            .try_into()
            .map_err(|_| Error::from(ErrorKind::Unsupported))
    }

    /// The raw fd, for handing to a system call. The descriptor stays owned; callers must
    /// not store the result past the immediate call.
    pub fn as_raw_descriptor(&self) -> RawDescriptor {
        self.owned.as_raw_fd()
    }

    /// Wraps a raw fd received from the transport.
    ///
    /// # Safety
    /// `descriptor` must be open, and nothing else may own or close it afterwards.
    pub unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> OwnedDescriptor {
        OwnedDescriptor {
            owned: OwnedFd::from_raw_fd(descriptor),
        }
    }

    /// Releases ownership of the fd to the caller, who becomes responsible for closing it.
    pub fn into_raw_descriptor(self) -> RawDescriptor {
        self.owned.into_raw_fd()
    }
}

impl From<OwnedFd> for OwnedDescriptor {
    fn from(owned: OwnedFd) -> OwnedDescriptor {
        OwnedDescriptor { owned }
    }
}
