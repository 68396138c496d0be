// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! device_memory: allocation and export policy for guest-visible device memory.
//!
//! Most images and buffers are non-external while most host-visible device memories need to
//! be externalized so the transport can share them. The allocation policy rewrites the
//! guest's allocation record to force an export path the host driver supports, falling back
//! to importing a gbm buffer when the driver can only import dma-bufs.

use log::error;

use crate::driver::Driver;
use crate::driver::GbmBuffer;
use crate::driver::GbmBufferParams;
use crate::driver::GbmDevice;
use crate::driver::PhysicalDeviceInfo;
use crate::driver::VENUS_MEMORY_PROPERTY_HOST_CACHED;
use crate::driver::VENUS_MEMORY_PROPERTY_HOST_COHERENT;
use crate::driver::VENUS_MEMORY_PROPERTY_HOST_VISIBLE;
use crate::driver::GBM_BO_USE_LINEAR;
use crate::driver::GBM_BO_USE_SW_READ_RARELY;
use crate::driver::GBM_BO_USE_SW_WRITE_RARELY;
use crate::driver::GBM_FORMAT_R8;
use crate::protocol::VENUS_ERROR_INVALID_EXTERNAL_HANDLE;
use crate::protocol::VENUS_ERROR_OUT_OF_DEVICE_MEMORY;
use crate::protocol::VENUS_ERROR_OUT_OF_HOST_MEMORY;
use crate::protocol::VENUS_ERROR_TOO_MANY_OBJECTS;
use crate::protocol::VENUS_ERROR_UNKNOWN;
use crate::protocol::VENUS_HANDLE_TYPE_DMA_BUF;
use crate::protocol::VENUS_HANDLE_TYPE_OPAQUE_FD;
use crate::resource::ResourceTable;
use crate::venus_os::OwnedDescriptor;
use crate::venus_utils::MapInfo;
use crate::venus_utils::ResourceFdType;
use crate::venus_utils::VenusBlob;
use crate::venus_utils::VenusError;
use crate::venus_utils::VenusResult;
use crate::venus_utils::VulkanInfo;
use crate::venus_utils::VENUS_BLOB_FLAG_USE_CROSS_DEVICE;
use crate::venus_utils::VENUS_BLOB_FLAG_USE_MAPPABLE;

/// One entry of the allocation record's extension chain. Callers own any descriptors; the
/// driver dups what it keeps.
pub enum AllocChainEntry {
    /// Guest request to build the memory from an already-imported resource.
    ImportResource { res_id: u32 },
    /// Host-side import of an external fd, produced by this policy.
    ImportFd {
        handle_type: u32,
        descriptor: OwnedDescriptor,
    },
    /// Export request with VENUS_HANDLE_TYPE_* bits.
    Export { handle_types: u32 },
}

/// The allocation record handed to the driver after policy transformation.
pub struct MemoryAllocateInfo {
    pub allocation_size: u64,
    pub memory_type_index: u32,
    pub chain: Vec<AllocChainEntry>,
}

/// Device-memory state persisted on the owning object after a successful allocation.
pub struct DeviceMemory {
    pub device_id: u64,
    pub property_flags: u32,
    /// VENUS_HANDLE kinds this memory can be exported as, `ResourceFdType::bit` encoded.
    pub valid_fd_types: u32,
    pub allocation_size: u64,
    pub memory_type_index: u32,
    /// Owned fallback buffer object keeping the imported dma-buf alive.
    pub gbm_buffer: Option<Box<dyn GbmBuffer>>,
    /// A memory is exported at most once; two resources must never share one storage.
    pub exported: bool,
    /// Host VA when the memory was exported through the mapping fallback.
    pub map_ptr: Option<u64>,
}

fn find_export(chain: &[AllocChainEntry]) -> Option<usize> {
    chain
        .iter()
        .position(|entry| matches!(entry, AllocChainEntry::Export { .. }))
}

/// 4 KiB alignment is used on all implementations we support.
fn align_to_4k(size: u64) -> u64 {
    (size + 4095) & !4095
}

fn gbm_import_fd(
    gbm: Option<&dyn GbmDevice>,
    allocation_size: u64,
) -> Result<(Box<dyn GbmBuffer>, OwnedDescriptor), i32> {
    // Reject sizes the buffer allocator cannot represent rather than letting the device
    // report a clamped maximum.
    if allocation_size > u32::MAX as u64 {
        return Err(VENUS_ERROR_OUT_OF_DEVICE_MEMORY);
    }

    let gbm = gbm.ok_or(VENUS_ERROR_OUT_OF_DEVICE_MEMORY)?;
    let bo = gbm
        .create_buffer(GbmBufferParams {
            width: align_to_4k(allocation_size),
            height: 1,
            format: GBM_FORMAT_R8,
            use_flags: GBM_BO_USE_LINEAR | GBM_BO_USE_SW_READ_RARELY | GBM_BO_USE_SW_WRITE_RARELY,
        })
        .map_err(|_| VENUS_ERROR_OUT_OF_DEVICE_MEMORY)?;

    let descriptor = bo.export_fd().map_err(|e| match e {
        VenusError::IoError(ref io) if io.raw_os_error() == Some(libc::EMFILE) => {
            VENUS_ERROR_TOO_MANY_OBJECTS
        }
        VenusError::NixError(nix::errno::Errno::EMFILE) => VENUS_ERROR_TOO_MANY_OBJECTS,
        _ => VENUS_ERROR_OUT_OF_HOST_MEMORY,
    })?;

    Ok((bo, descriptor))
}

/// Transforms the guest allocation record in place, choosing an externalization path.
///
/// Returns the resulting `valid_fd_types` mask and the fallback buffer object, if one was
/// allocated. Driver result codes come back as `VenusError::DriverError` so the command
/// reply can carry them without marking the context fatal; a dangling resource reference is
/// a protocol error instead.
pub fn prepare_allocation(
    resources: &ResourceTable,
    physical: &PhysicalDeviceInfo,
    gbm: Option<&dyn GbmDevice>,
    info: &mut MemoryAllocateInfo,
) -> VenusResult<(u32, Option<Box<dyn GbmBuffer>>)> {
    let memory_type = physical
        .memory_types
        .get(info.memory_type_index as usize)
        .ok_or(VenusError::DriverError(VENUS_ERROR_UNKNOWN))?;
    let property_flags = memory_type.property_flags;

    // Translate an import-resource entry into an fd import in place. Forcing external is
    // skipped in that case since the mapping is set up from the existing resource.
    let import_pos = info
        .chain
        .iter()
        .position(|entry| matches!(entry, AllocChainEntry::ImportResource { .. }));
    if let Some(pos) = import_pos {
        let res_id = match info.chain[pos] {
            AllocChainEntry::ImportResource { res_id } => res_id,
            _ => unreachable!(),
        };
        let (fd_type, descriptor) = resources.dup_descriptor(res_id).map_err(|e| match e {
            VenusError::InvalidResourceId(_) => {
                error!("failed to import resource: invalid res_id {}", res_id);
                e
            }
            _ => VenusError::DriverError(VENUS_ERROR_INVALID_EXTERNAL_HANDLE),
        })?;
        let handle_type = match fd_type {
            ResourceFdType::DmaBuf => VENUS_HANDLE_TYPE_DMA_BUF,
            ResourceFdType::OpaqueFd => VENUS_HANDLE_TYPE_OPAQUE_FD,
            _ => return Err(VenusError::DriverError(VENUS_ERROR_INVALID_EXTERNAL_HANDLE)),
        };
        info.chain[pos] = AllocChainEntry::ImportFd {
            handle_type,
            descriptor,
        };
        return Ok((0, None));
    }

    let mut valid_fd_types = 0;
    let mut gbm_buffer = None;

    if property_flags & VENUS_MEMORY_PROPERTY_HOST_VISIBLE != 0 {
        let export_pos = find_export(&info.chain);
        // Without dma-buf fd export support, a guest that asked for dma-buf export must go
        // through the gbm import path instead of being forced onto opaque fds.
        let no_dma_buf_export = match export_pos {
            Some(pos) => match info.chain[pos] {
                AllocChainEntry::Export { handle_types } => {
                    handle_types & VENUS_HANDLE_TYPE_DMA_BUF == 0
                }
                _ => unreachable!(),
            },
            None => true,
        };

        if physical.dma_buf_fd_export_supported
            || (physical.opaque_fd_export_supported && no_dma_buf_export)
        {
            let forced = if physical.dma_buf_fd_export_supported {
                VENUS_HANDLE_TYPE_DMA_BUF
            } else {
                VENUS_HANDLE_TYPE_OPAQUE_FD
            };
            match export_pos {
                Some(pos) => {
                    if let AllocChainEntry::Export { handle_types } = &mut info.chain[pos] {
                        *handle_types |= forced;
                    }
                }
                None => info.chain.push(AllocChainEntry::Export {
                    handle_types: forced,
                }),
            }
        } else if physical.external_memory_dma_buf {
            // Allocate a gbm bo to force a dma-buf fd import. Any export entry is stripped
            // since the only valid fd type is dma-buf here.
            info.chain
                .retain(|entry| !matches!(entry, AllocChainEntry::Export { .. }));

            let (bo, descriptor) = gbm_import_fd(gbm, info.allocation_size)
                .map_err(VenusError::DriverError)?;
            info.chain.push(AllocChainEntry::ImportFd {
                handle_type: VENUS_HANDLE_TYPE_DMA_BUF,
                descriptor,
            });
            valid_fd_types = ResourceFdType::DmaBuf.bit();
            gbm_buffer = Some(bo);
        }
    }

    if let Some(pos) = find_export(&info.chain) {
        if let AllocChainEntry::Export { handle_types } = info.chain[pos] {
            if handle_types & VENUS_HANDLE_TYPE_OPAQUE_FD != 0 {
                valid_fd_types |= ResourceFdType::OpaqueFd.bit();
            }
            if handle_types & VENUS_HANDLE_TYPE_DMA_BUF != 0 {
                valid_fd_types |= ResourceFdType::DmaBuf.bit();
            }
        }
    }

    Ok((valid_fd_types, gbm_buffer))
}

/// Exports a device memory as a guest-visible blob, choosing the best fd type the memory
/// supports or falling back to a host mapping.
pub fn export_blob(
    mem: &mut DeviceMemory,
    handle: u64,
    ctx_id: u32,
    driver: &dyn Driver,
    blob_size: u64,
    blob_flags: u32,
) -> VenusResult<VenusBlob> {
    // A memory can only be exported once; we don't want two resources pointing at the same
    // storage.
    if mem.exported {
        error!("memory has already been exported");
        return Err(VenusError::AlreadyExported);
    }

    let mut map_info = MapInfo::None;
    if blob_flags & VENUS_BLOB_FLAG_USE_MAPPABLE != 0 {
        let visible = mem.property_flags & VENUS_MEMORY_PROPERTY_HOST_VISIBLE != 0;
        let coherent = mem.property_flags & VENUS_MEMORY_PROPERTY_HOST_COHERENT != 0;
        let cached = mem.property_flags & VENUS_MEMORY_PROPERTY_HOST_CACHED != 0;
        if !visible {
            error!("memory cannot back a mappable blob");
            return Err(VenusError::Unsupported);
        }
        map_info = if coherent && cached {
            MapInfo::Cached
        } else {
            MapInfo::WriteCombined
        };
    }

    let can_export_dma_buf = mem.valid_fd_types & ResourceFdType::DmaBuf.bit() != 0;
    let can_export_opaque = mem.valid_fd_types & ResourceFdType::OpaqueFd.bit() != 0;

    let blob = if blob_flags & VENUS_BLOB_FLAG_USE_CROSS_DEVICE != 0 && !can_export_dma_buf {
        error!("memory cannot export a dma-buf for cross device sharing");
        return Err(VenusError::Unsupported);
    } else if can_export_dma_buf {
        let descriptor = match &mem.gbm_buffer {
            Some(bo) => bo.export_fd()?,
            None => driver.export_memory_fd(ctx_id, handle, VENUS_HANDLE_TYPE_DMA_BUF)?,
        };
        let dma_buf_size = descriptor.region_size()?;
        if dma_buf_size < blob_size {
            error!("dma-buf size {} < blob size {}", dma_buf_size, blob_size);
            return Err(VenusError::Unsupported);
        }
        VenusBlob {
            fd_type: ResourceFdType::DmaBuf,
            descriptor: Some(descriptor),
            map_ptr: 0,
            map_info,
            vulkan_info: None,
        }
    } else if can_export_opaque {
        let descriptor = driver.export_memory_fd(ctx_id, handle, VENUS_HANDLE_TYPE_OPAQUE_FD)?;
        let id_props = driver.physical_device();
        VenusBlob {
            fd_type: ResourceFdType::OpaqueFd,
            descriptor: Some(descriptor),
            map_ptr: 0,
            map_info,
            // The guest re-derives compatibility from the device and driver UUIDs.
            vulkan_info: Some(VulkanInfo {
                device_uuid: id_props.device_uuid,
                driver_uuid: id_props.driver_uuid,
                allocation_size: mem.allocation_size,
                memory_type_index: mem.memory_type_index,
            }),
        }
    } else {
        let map_ptr = driver.map_memory(ctx_id, handle, mem.allocation_size)?;
        mem.map_ptr = Some(map_ptr);
        VenusBlob {
            fd_type: ResourceFdType::None,
            descriptor: None,
            map_ptr,
            map_info,
            vulkan_info: Some(VulkanInfo {
                device_uuid: [0; 16],
                driver_uuid: [0; 16],
                allocation_size: mem.allocation_size,
                memory_type_index: mem.memory_type_index,
            }),
        }
    };

    mem.exported = true;
    Ok(blob)
}
