// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! driver: the host graphics driver seam.
//!
//! The renderer core treats the driver as an external collaborator reached through the
//! `Driver` trait, the Rust rendition of the C function table a real backend installs.
//! The fallback buffer allocator is a separate seam since it is independent of the driver.

use crate::device_memory::MemoryAllocateInfo;
use crate::object::ObjectType;
use crate::venus_os::OwnedDescriptor;
use crate::venus_utils::VenusResult;

/// Memory property flags, one record per memory type of the physical device.
pub const VENUS_MEMORY_PROPERTY_DEVICE_LOCAL: u32 = 0x0001;
pub const VENUS_MEMORY_PROPERTY_HOST_VISIBLE: u32 = 0x0002;
pub const VENUS_MEMORY_PROPERTY_HOST_COHERENT: u32 = 0x0004;
pub const VENUS_MEMORY_PROPERTY_HOST_CACHED: u32 = 0x0008;

#[derive(Copy, Clone, Debug, Default)]
pub struct MemoryType {
    pub property_flags: u32,
}

/// Capability record of the physical device behind the driver, captured once at context
/// creation and read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct PhysicalDeviceInfo {
    pub device_uuid: [u8; 16],
    pub driver_uuid: [u8; 16],
    pub memory_types: Vec<MemoryType>,
    pub dma_buf_fd_export_supported: bool,
    pub opaque_fd_export_supported: bool,
    /// The driver can import dma-bufs even when it cannot export them.
    pub external_memory_dma_buf: bool,
}

/// Host driver interface required by the renderer core.
///
/// Implementations are shared read-only across the dispatch, monitor, and retirement
/// threads after context construction.
pub trait Driver: Send + Sync {
    fn physical_device(&self) -> &PhysicalDeviceInfo;

    /// Creates the driver-side object backing a guest object and returns its handle.
    fn create_object(&self, ctx_id: u32, object_type: ObjectType) -> VenusResult<u64>;

    /// Destroys a driver-side object. Exactly one call per successfully created object.
    fn destroy_object(&self, ctx_id: u32, object_type: ObjectType, handle: u64);

    /// Allocates device memory with the transformed allocation record. Failures are driver
    /// result codes surfaced in the command reply, not renderer errors.
    fn allocate_memory(&self, ctx_id: u32, info: &MemoryAllocateInfo) -> VenusResult<u64>;

    fn free_memory(&self, ctx_id: u32, handle: u64);

    /// GetMemoryFdKHR equivalent: exports the memory as the given external handle type.
    fn export_memory_fd(
        &self,
        ctx_id: u32,
        handle: u64,
        handle_type: u32,
    ) -> VenusResult<OwnedDescriptor>;

    /// Maps the memory and returns the host VA.
    fn map_memory(&self, ctx_id: u32, handle: u64, size: u64) -> VenusResult<u64>;

    fn unmap_memory(&self, ctx_id: u32, handle: u64);

    /// Forwards a fence to the driver; completion arrives asynchronously through the
    /// renderer's retirement entry point.
    fn submit_fence(&self, ctx_id: u32, flags: u32, ring_idx: u32, fence_id: u64)
        -> VenusResult<()>;

    /// Liveness hook invoked by the ring monitor before the host watchdog fires.
    fn mark_ring_alive(&self, ctx_id: u32, ring_id: u64);

    /// Loads the current seqno of the given timeline from the driver's shared region.
    fn load_timeline_seqno(&self, ctx_id: u32, ring_idx: u32) -> u32;
}

/* gbm constants needed by the fallback allocation path */
pub const GBM_FORMAT_R8: u32 = 0x20203852; /* fourcc 'R8  ' */
pub const GBM_BO_USE_LINEAR: u32 = 1 << 4;
pub const GBM_BO_USE_SW_READ_RARELY: u32 = 1 << 10;
pub const GBM_BO_USE_SW_WRITE_RARELY: u32 = 1 << 12;

#[derive(Copy, Clone, Debug)]
pub struct GbmBufferParams {
    /// Width in bytes; u64 so a maximum-size single-row buffer is expressible.
    pub width: u64,
    pub height: u32,
    pub format: u32,
    pub use_flags: u32,
}

/// An owned buffer object from the fallback allocator.
pub trait GbmBuffer: Send {
    /// Exports a new fd for the buffer. Each call duplicates; the buffer keeps ownership.
    fn export_fd(&self) -> VenusResult<OwnedDescriptor>;
}

/// Process-global fallback allocator, assumed thread-safe for concurrent buffer creation.
pub trait GbmDevice: Send + Sync {
    fn create_buffer(&self, params: GbmBufferParams) -> VenusResult<Box<dyn GbmBuffer>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::VENUS_ERROR_UNKNOWN;
    use crate::venus_os::SharedMemory;
    use crate::venus_utils::VenusError;

    #[derive(Default)]
    pub struct DriverLog {
        pub destroyed_objects: Vec<(ObjectType, u64)>,
        pub freed_memories: Vec<u64>,
        pub unmapped_memories: Vec<u64>,
        pub submitted_fences: Vec<(u32, u32, u64)>,
        pub marked_alive: Vec<u64>,
    }

    /// Driver double that hands out monotonic handles and records teardown calls.
    pub struct FakeDriver {
        pub info: PhysicalDeviceInfo,
        next_handle: AtomicU64,
        pub log: Mutex<DriverLog>,
        pub fail_submit: Mutex<bool>,
        pub fail_alloc: Mutex<Option<i32>>,
        pub timeline_seqnos: Mutex<[u32; 64]>,
    }

    impl FakeDriver {
        pub fn new(info: PhysicalDeviceInfo) -> Arc<FakeDriver> {
            Arc::new(FakeDriver {
                info,
                next_handle: AtomicU64::new(1),
                log: Default::default(),
                fail_submit: Mutex::new(false),
                fail_alloc: Mutex::new(None),
                timeline_seqnos: Mutex::new([0; 64]),
            })
        }

        /// A host-visible, coherent-only device with every export path available.
        pub fn default_info() -> PhysicalDeviceInfo {
            PhysicalDeviceInfo {
                device_uuid: [0xaa; 16],
                driver_uuid: [0xbb; 16],
                memory_types: vec![MemoryType {
                    property_flags: VENUS_MEMORY_PROPERTY_HOST_VISIBLE
                        | VENUS_MEMORY_PROPERTY_HOST_COHERENT,
                }],
                dma_buf_fd_export_supported: true,
                opaque_fd_export_supported: true,
                external_memory_dma_buf: true,
            }
        }
    }

    impl Driver for FakeDriver {
        fn physical_device(&self) -> &PhysicalDeviceInfo {
            &self.info
        }

        fn create_object(&self, _ctx_id: u32, _object_type: ObjectType) -> VenusResult<u64> {
            Ok(self.next_handle.fetch_add(1, Ordering::SeqCst))
        }

        fn destroy_object(&self, _ctx_id: u32, object_type: ObjectType, handle: u64) {
            self.log
                .lock()
                .unwrap()
                .destroyed_objects
                .push((object_type, handle));
        }

        fn allocate_memory(&self, _ctx_id: u32, _info: &MemoryAllocateInfo) -> VenusResult<u64> {
            if let Some(code) = *self.fail_alloc.lock().unwrap() {
                return Err(VenusError::DriverError(code));
            }
            Ok(self.next_handle.fetch_add(1, Ordering::SeqCst))
        }

        fn free_memory(&self, _ctx_id: u32, handle: u64) {
            self.log.lock().unwrap().freed_memories.push(handle);
        }

        fn export_memory_fd(
            &self,
            _ctx_id: u32,
            _handle: u64,
            _handle_type: u32,
        ) -> VenusResult<OwnedDescriptor> {
            // A real region so size probes and dups behave.
            Ok(SharedMemory::new("fake_export", 0x10000)?.into())
        }

        fn map_memory(&self, _ctx_id: u32, _handle: u64, _size: u64) -> VenusResult<u64> {
            Ok(0xdead_b000)
        }

        fn unmap_memory(&self, _ctx_id: u32, handle: u64) {
            self.log.lock().unwrap().unmapped_memories.push(handle);
        }

        fn submit_fence(
            &self,
            _ctx_id: u32,
            flags: u32,
            ring_idx: u32,
            fence_id: u64,
        ) -> VenusResult<()> {
            if *self.fail_submit.lock().unwrap() {
                return Err(VenusError::DriverError(VENUS_ERROR_UNKNOWN));
            }
            self.log
                .lock()
                .unwrap()
                .submitted_fences
                .push((flags, ring_idx, fence_id));
            Ok(())
        }

        fn mark_ring_alive(&self, _ctx_id: u32, ring_id: u64) {
            self.log.lock().unwrap().marked_alive.push(ring_id);
        }

        fn load_timeline_seqno(&self, _ctx_id: u32, ring_idx: u32) -> u32 {
            self.timeline_seqnos.lock().unwrap()[ring_idx as usize]
        }
    }

    #[derive(Default)]
    pub struct FakeGbmDevice {
        pub created: Mutex<Vec<GbmBufferParams>>,
        pub fail_export_errno: Mutex<Option<i32>>,
    }

    pub struct FakeGbmBuffer {
        size: u64,
        fail_export_errno: Option<i32>,
    }

    impl GbmBuffer for FakeGbmBuffer {
        fn export_fd(&self) -> VenusResult<OwnedDescriptor> {
            if let Some(errno) = self.fail_export_errno {
                return Err(VenusError::IoError(std::io::Error::from_raw_os_error(
                    errno,
                )));
            }
            Ok(SharedMemory::new("fake_gbm_bo", self.size.min(0x10000))?.into())
        }
    }

    impl GbmDevice for FakeGbmDevice {
        fn create_buffer(&self, params: GbmBufferParams) -> VenusResult<Box<dyn GbmBuffer>> {
            self.created.lock().unwrap().push(params);
            Ok(Box::new(FakeGbmBuffer {
                size: params.width,
                fail_export_errno: *self.fail_export_errno.lock().unwrap(),
            }))
        }
    }
}
