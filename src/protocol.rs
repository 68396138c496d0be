// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! protocol: wire layout of the framed command stream and its reply records.
//!
//! Every command is a length-prefixed frame starting with `venus_cmd_hdr`; `cmd_size` is the
//! full frame size in bytes, header included. Replies are written to the guest-visible reply
//! region selected by `VENUS_CCMD_SET_REPLY`.

#![allow(non_camel_case_types)]

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/* ring commands */
pub const VENUS_CCMD_CREATE_RING: u32 = 0x101;
pub const VENUS_CCMD_DESTROY_RING: u32 = 0x102;
pub const VENUS_CCMD_WAIT_RING_SEQNO: u32 = 0x103;

/* transport commands */
pub const VENUS_CCMD_SET_REPLY: u32 = 0x201;

/* object commands */
pub const VENUS_CCMD_CREATE_OBJECT: u32 = 0x301;
pub const VENUS_CCMD_DESTROY_OBJECT: u32 = 0x302;

/* device memory commands */
pub const VENUS_CCMD_ALLOCATE_MEMORY: u32 = 0x401;
pub const VENUS_CCMD_FREE_MEMORY: u32 = 0x402;

/* external memory handle types, as reported by the host driver */
pub const VENUS_HANDLE_TYPE_OPAQUE_FD: u32 = 0x0001;
pub const VENUS_HANDLE_TYPE_DMA_BUF: u32 = 0x0200;

/* result codes carried in reply records */
pub const VENUS_SUCCESS: i32 = 0;
pub const VENUS_ERROR_OUT_OF_HOST_MEMORY: i32 = -1;
pub const VENUS_ERROR_OUT_OF_DEVICE_MEMORY: i32 = -2;
pub const VENUS_ERROR_TOO_MANY_OBJECTS: i32 = -10;
pub const VENUS_ERROR_UNKNOWN: i32 = -13;
pub const VENUS_ERROR_INVALID_EXTERNAL_HANDLE: i32 = -1000072003;

#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct venus_cmd_hdr {
    pub opcode: u32,
    pub cmd_size: u32,
}

/* VENUS_CCMD_CREATE_RING */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct venus_cmd_create_ring {
    pub ring_id: u64,
    /// Shm resource holding the ring control region.
    pub res_id: u32,
    /// Byte offset of the head seqno within the resource.
    pub head_offset: u32,
    /// Non-zero to include the ring in liveness monitoring.
    pub monitored: u32,
    pub padding: u32,
}

/* VENUS_CCMD_DESTROY_RING */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct venus_cmd_destroy_ring {
    pub ring_id: u64,
}

/* VENUS_CCMD_WAIT_RING_SEQNO */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct venus_cmd_wait_ring_seqno {
    pub ring_id: u64,
    pub seqno: u64,
}

/* VENUS_CCMD_SET_REPLY */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct venus_cmd_set_reply {
    pub res_id: u32,
    pub padding: u32,
    pub offset: u64,
    pub size: u64,
}

/* VENUS_CCMD_CREATE_OBJECT */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct venus_cmd_create_object {
    pub object_id: u64,
    /// Owning object, 0 for root objects.
    pub parent_id: u64,
    pub object_type: u32,
    pub padding: u32,
}

/* VENUS_CCMD_DESTROY_OBJECT */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct venus_cmd_destroy_object {
    pub object_id: u64,
}

/* VENUS_CCMD_ALLOCATE_MEMORY */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct venus_cmd_allocate_memory {
    pub device_id: u64,
    pub memory_id: u64,
    pub allocation_size: u64,
    pub memory_type_index: u32,
    /// Resource to import the memory from, 0 for a fresh allocation.
    pub import_res_id: u32,
    /// Export handle types requested by the guest, VENUS_HANDLE_TYPE_* bits.
    pub export_handle_types: u32,
    pub padding: u32,
}

/* VENUS_CCMD_FREE_MEMORY */
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct venus_cmd_free_memory {
    pub memory_id: u64,
}

/// Reply record for commands that produce a driver result code.
#[derive(Copy, Clone, Debug, Default, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct venus_cmd_reply {
    pub result: i32,
    pub padding: u32,
}
