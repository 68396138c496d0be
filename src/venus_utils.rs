// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! venus_utils: enums, structs, and helpers needed by the rest of the crate.

use std::io::Error as IoError;
use std::num::TryFromIntError;
use std::sync::Arc;

use remain::sorted;
use thiserror::Error;

use crate::venus_os::OwnedDescriptor;

/// An error generated while using this crate.
#[sorted]
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum VenusError {
    /// The device memory was already exported and a second export was attempted.
    #[error("memory has already been exported")]
    AlreadyExported,
    /// The context refused the operation because a prior protocol violation made it fatal.
    #[error("context is in a fatal state")]
    ContextFatal,
    /// The host driver failed with the contained result code.
    #[error("host driver failed with error {0}")]
    DriverError(i32),
    /// A command buffer was submitted with an invalid size.
    #[error("command buffer submitted with invalid size: {0}")]
    InvalidCommandSize(usize),
    /// Invalid context id.
    #[error("invalid context id {0}")]
    InvalidContextId(u32),
    /// Invalid object id.
    #[error("invalid object id {0}")]
    InvalidObjectId(u64),
    /// Invalid resource id.
    #[error("invalid resource id {0}")]
    InvalidResourceId(u32),
    /// Invalid ring id.
    #[error("invalid ring id {0}")]
    InvalidRingId(u64),
    /// A fence named a timeline outside the supported range.
    #[error("invalid ring index {0}")]
    InvalidRingIndex(u32),
    /// An input/output error occurred.
    #[error("an input/output error occurred: {0}")]
    IoError(#[from] IoError),
    /// A system call failed with the contained errno.
    #[error("the errno is {0}")]
    NixError(#[from] nix::Error),
    /// Violation of the renderer protocol by the guest.
    #[error("violation of the renderer protocol: {0}")]
    SpecViolation(&'static str),
    /// An attempted integer conversion failed.
    #[error("int conversion failed: {0}")]
    TryFromIntError(#[from] TryFromIntError),
    /// The command or feature is unsupported.
    #[error("feature or function unsupported")]
    Unsupported,
}

/// The result of an operation in this crate.
pub type VenusResult<T> = std::result::Result<T, VenusError>;

/// Blob resource creation flags, set by the guest.
pub const VENUS_BLOB_FLAG_USE_MAPPABLE: u32 = 0x0001;
pub const VENUS_BLOB_FLAG_USE_SHAREABLE: u32 = 0x0002;
pub const VENUS_BLOB_FLAG_USE_CROSS_DEVICE: u32 = 0x0004;

/// Fence creation flags.
pub const VENUS_FLAG_FENCE: u32 = 1 << 0;

/// How a resource or exported blob is materialized for the transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourceFdType {
    /// No backing handle; the blob is reached through a host mapping only.
    None,
    DmaBuf,
    OpaqueFd,
    Shm,
}

impl ResourceFdType {
    /// Bit used in `valid_fd_types` masks for this fd type.
    pub fn bit(self) -> u32 {
        match self {
            ResourceFdType::None => 0,
            ResourceFdType::DmaBuf => 1 << 1,
            ResourceFdType::OpaqueFd => 1 << 2,
            ResourceFdType::Shm => 1 << 3,
        }
    }
}

/// Cacheability of a mapping handed to the guest.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum MapInfo {
    #[default]
    None,
    Cached,
    WriteCombined,
}

/// Memory index and id properties of the exporting physical device, echoed to the guest so
/// it can re-derive compatibility for opaque fd imports.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct VulkanInfo {
    pub device_uuid: [u8; 16],
    pub driver_uuid: [u8; 16],
    pub allocation_size: u64,
    pub memory_type_index: u32,
}

/// The result of exporting a device memory as a guest-visible blob.
pub struct VenusBlob {
    pub fd_type: ResourceFdType,
    /// Present unless `fd_type` is `None`, in which case `map_ptr` is.
    pub descriptor: Option<OwnedDescriptor>,
    /// Host VA of the fallback mapping, 0 if unmapped.
    pub map_ptr: u64,
    pub map_info: MapInfo,
    pub vulkan_info: Option<VulkanInfo>,
}

/// Convenience struct for renderer fences.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VenusFence {
    pub flags: u32,
    pub fence_id: u64,
    pub ctx_id: u32,
    pub ring_idx: u32,
}

/// Handler executed when a fence retires, or on other renderer completions.
pub struct VenusHandler<S> {
    closure: Arc<dyn Fn(S) + Send + Sync>,
}

impl<S> VenusHandler<S> {
    pub fn new<F>(closure: F) -> VenusHandler<S>
    where
        F: Fn(S) + Send + Sync + 'static,
    {
        VenusHandler {
            closure: Arc::new(closure),
        }
    }

    pub fn call(&self, data: S) {
        (self.closure)(data)
    }
}

impl<S> Clone for VenusHandler<S> {
    fn clone(&self) -> VenusHandler<S> {
        VenusHandler {
            closure: self.closure.clone(),
        }
    }
}

pub type VenusFenceHandler = VenusHandler<VenusFence>;

/// Returns true iff seqno `cur` is at or past `target`, taking wraparound into account.
///
/// The protocol supports 64-bit seqnos but the delta between a ring head and any waited-on
/// seqno never exceeds the ring size, which is far smaller than the 32-bit limit, so
/// truncated comparison is safe.
pub fn seqno_passed(cur: u32, target: u32) -> bool {
    cur.wrapping_sub(target) < 1 << 31
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_passed_boundaries() {
        assert!(seqno_passed(0, 0));
        assert!(seqno_passed(1, 0));
        assert!(!seqno_passed(0, 1));

        // Exactly half the space ahead still counts as passed.
        assert!(seqno_passed((1 << 31) - 1, 0));
        // One past half the space does not.
        assert!(!seqno_passed(1 << 31, 0));

        // Wraparound: u32::MAX is behind 0, and 0 is ahead of u32::MAX.
        assert!(!seqno_passed(u32::MAX, 0));
        assert!(seqno_passed(0, u32::MAX));
        assert!(seqno_passed(5, u32::MAX));
    }

    #[test]
    fn handler_runs_closure() {
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let count_clone = count.clone();
        let handler: VenusFenceHandler = VenusHandler::new(move |_| {
            count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let clone = handler.clone();
        clone.call(VenusFence {
            flags: VENUS_FLAG_FENCE,
            fence_id: 1,
            ctx_id: 1,
            ring_idx: 0,
        });
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
