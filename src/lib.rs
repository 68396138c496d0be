// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A crate for servicing guest GPU clients of a virtualization transport: per-context
//! object and resource tables, command decode and dispatch, ring coordination with
//! liveness monitoring, device-memory export policy, and fence/timeline retirement.

mod codec;
mod context;
mod device_memory;
mod dispatch;
mod driver;
mod object;
pub mod protocol;
mod renderer;
mod resource;
mod ring;
mod timeline;
mod venus_os;
mod venus_utils;

pub use crate::codec::Decoder;
pub use crate::codec::Frame;
pub use crate::codec::ReplyStream;
pub use crate::context::VenusContext;
pub use crate::device_memory::AllocChainEntry;
pub use crate::device_memory::DeviceMemory;
pub use crate::device_memory::MemoryAllocateInfo;
pub use crate::driver::Driver;
pub use crate::driver::GbmBuffer;
pub use crate::driver::GbmBufferParams;
pub use crate::driver::GbmDevice;
pub use crate::driver::MemoryType;
pub use crate::driver::PhysicalDeviceInfo;
pub use crate::driver::GBM_BO_USE_LINEAR;
pub use crate::driver::GBM_BO_USE_SW_READ_RARELY;
pub use crate::driver::GBM_BO_USE_SW_WRITE_RARELY;
pub use crate::driver::GBM_FORMAT_R8;
pub use crate::driver::VENUS_MEMORY_PROPERTY_DEVICE_LOCAL;
pub use crate::driver::VENUS_MEMORY_PROPERTY_HOST_CACHED;
pub use crate::driver::VENUS_MEMORY_PROPERTY_HOST_COHERENT;
pub use crate::driver::VENUS_MEMORY_PROPERTY_HOST_VISIBLE;
pub use crate::object::ObjectType;
pub use crate::renderer::Renderer;
pub use crate::renderer::RendererBuilder;
pub use crate::resource::ResourceStorage;
pub use crate::resource::ResourceTable;
pub use crate::resource::VenusResource;
pub use crate::ring::Ring;
pub use crate::ring::VENUS_MAX_RINGS;
pub use crate::timeline::VENUS_TIMELINE_COUNT;
pub use crate::venus_os::MemoryMapping;
pub use crate::venus_os::OwnedDescriptor;
pub use crate::venus_os::RawDescriptor;
pub use crate::venus_os::SharedMemory;
pub use crate::venus_utils::*;
