// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! dispatch: routes decoded frames to per-opcode handlers.
//!
//! Handlers follow a uniform contract: read inputs, validate referenced ids, perform the
//! driver call, capture outputs into the reply record. An `Err` from a handler is a guest
//! protocol violation and marks the context fatal; host-side exhaustion is carried in the
//! reply record instead and leaves the context usable.

use log::error;

use crate::codec::Decoder;
use crate::codec::Frame;
use crate::context::VenusContext;
use crate::device_memory::prepare_allocation;
use crate::device_memory::AllocChainEntry;
use crate::device_memory::DeviceMemory;
use crate::device_memory::MemoryAllocateInfo;
use crate::object::ObjectPayload;
use crate::object::ObjectType;
use crate::object::VenusObject;
use crate::protocol::*;
use crate::ring::Ring;
use crate::venus_utils::VenusError;
use crate::venus_utils::VenusResult;

pub(crate) fn process_cmd_stream(ctx: &VenusContext, buffer: &[u8]) -> VenusResult<()> {
    let mut decoder = Decoder::new(buffer);
    let mut result = Ok(());

    loop {
        let frame = match decoder.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                error!("ctx {}: malformed command stream: {}", ctx.ctx_id(), e);
                ctx.set_fatal();
                return Err(e);
            }
        };

        // Once fatal, drain the remaining frames without executing them.
        if ctx.fatal() {
            continue;
        }

        let opcode = frame.opcode;
        if let Err(e) = execute(ctx, frame) {
            error!("ctx {}: opcode {:#x} failed: {}", ctx.ctx_id(), opcode, e);
            ctx.set_fatal();
            result = Err(e);
        }
    }

    result
}

fn execute(ctx: &VenusContext, mut frame: Frame) -> VenusResult<()> {
    match frame.opcode {
        VENUS_CCMD_CREATE_RING => create_ring(ctx, frame.read_args()?),
        VENUS_CCMD_DESTROY_RING => destroy_ring(ctx, frame.read_args()?),
        VENUS_CCMD_WAIT_RING_SEQNO => wait_ring_seqno(ctx, frame.read_args()?),
        VENUS_CCMD_SET_REPLY => set_reply(ctx, frame.read_args()?),
        VENUS_CCMD_CREATE_OBJECT => create_object(ctx, frame.read_args()?),
        VENUS_CCMD_DESTROY_OBJECT => destroy_object(ctx, frame.read_args()?),
        VENUS_CCMD_ALLOCATE_MEMORY => allocate_memory(ctx, frame.read_args()?),
        VENUS_CCMD_FREE_MEMORY => free_memory(ctx, frame.read_args()?),
        opcode => {
            error!("unknown opcode {:#x}", opcode);
            Err(VenusError::Unsupported)
        }
    }
}

fn write_reply<T: zerocopy::AsBytes>(ctx: &VenusContext, val: T) -> VenusResult<()> {
    let mut reply = ctx.reply.lock().unwrap();
    match reply.as_mut() {
        Some(stream) => stream.write_obj(val),
        None => Err(VenusError::SpecViolation("reply region not set")),
    }
}

fn write_result(ctx: &VenusContext, result: i32) -> VenusResult<()> {
    write_reply(
        ctx,
        venus_cmd_reply {
            result,
            padding: 0,
        },
    )
}

fn create_ring(ctx: &VenusContext, args: venus_cmd_create_ring) -> VenusResult<()> {
    let mapping = ctx.resources.mapping(args.res_id)?;
    let ring = Ring::new(
        args.ring_id,
        mapping,
        args.head_offset as usize,
        args.monitored != 0,
    )?;
    ctx.rings.attach(ring)
}

fn destroy_ring(ctx: &VenusContext, args: venus_cmd_destroy_ring) -> VenusResult<()> {
    ctx.rings.detach(args.ring_id)
}

fn wait_ring_seqno(ctx: &VenusContext, args: venus_cmd_wait_ring_seqno) -> VenusResult<()> {
    // A false return means teardown aborted the wait; the batch is being drained anyway.
    ctx.rings.wait_seqno(args.ring_id, args.seqno)?;
    Ok(())
}

fn set_reply(ctx: &VenusContext, args: venus_cmd_set_reply) -> VenusResult<()> {
    let mapping = ctx.resources.mapping(args.res_id)?;
    let stream = crate::codec::ReplyStream::new(mapping, args.offset, args.size)?;
    *ctx.reply.lock().unwrap() = Some(stream);
    Ok(())
}

fn create_object(ctx: &VenusContext, args: venus_cmd_create_object) -> VenusResult<()> {
    let object_type = ObjectType::from_raw(args.object_type)
        .ok_or(VenusError::SpecViolation("unrecognized object type"))?;
    if object_type == ObjectType::DeviceMemory {
        return Err(VenusError::SpecViolation(
            "device memory is created through allocation",
        ));
    }
    if !ctx.objects.validate_id(args.object_id) {
        return Err(VenusError::InvalidObjectId(args.object_id));
    }
    if args.parent_id != 0 && !ctx.objects.contains(args.parent_id) {
        return Err(VenusError::InvalidObjectId(args.parent_id));
    }

    let handle = match ctx.driver().create_object(ctx.ctx_id(), object_type) {
        Ok(handle) => handle,
        Err(VenusError::DriverError(code)) => return write_result(ctx, code),
        Err(e) => return Err(e),
    };

    let payload = match object_type {
        ObjectType::Device => ObjectPayload::Device { children: vec![] },
        _ => ObjectPayload::None,
    };
    ctx.objects
        .insert(VenusObject::new(args.object_id, object_type, handle, payload))?;
    if args.parent_id != 0 {
        ctx.objects.track_child(args.parent_id, args.object_id);
    }

    write_result(ctx, VENUS_SUCCESS)
}

fn destroy_object(ctx: &VenusContext, args: venus_cmd_destroy_object) -> VenusResult<()> {
    let obj = ctx
        .objects
        .remove(args.object_id)
        .ok_or(VenusError::InvalidObjectId(args.object_id))?;

    // Destroying a device reaps its tracked children first, destructors deferred outside
    // the table guard.
    if let ObjectPayload::Device { children } = &obj.payload {
        for child in ctx.objects.remove_all(children) {
            ctx.run_object_destructor(child);
        }
    }

    ctx.run_object_destructor(obj);
    Ok(())
}

fn allocate_memory(ctx: &VenusContext, args: venus_cmd_allocate_memory) -> VenusResult<()> {
    if !ctx.objects.validate_id(args.memory_id) {
        return Err(VenusError::InvalidObjectId(args.memory_id));
    }
    let device_ok = ctx
        .objects
        .with_object(args.device_id, |obj| obj.object_type == ObjectType::Device)
        .unwrap_or(false);
    if !device_ok {
        error!("allocation names invalid device {}", args.device_id);
        return Err(VenusError::InvalidObjectId(args.device_id));
    }

    let mut chain = Vec::new();
    if args.import_res_id != 0 {
        chain.push(AllocChainEntry::ImportResource {
            res_id: args.import_res_id,
        });
    }
    if args.export_handle_types != 0 {
        chain.push(AllocChainEntry::Export {
            handle_types: args.export_handle_types,
        });
    }
    let mut info = MemoryAllocateInfo {
        allocation_size: args.allocation_size,
        memory_type_index: args.memory_type_index,
        chain,
    };

    let (valid_fd_types, gbm_buffer) = match prepare_allocation(
        &ctx.resources,
        ctx.driver().physical_device(),
        ctx.gbm(),
        &mut info,
    ) {
        Ok(prepared) => prepared,
        Err(VenusError::DriverError(code)) => return write_result(ctx, code),
        Err(e) => return Err(e),
    };

    let handle = match ctx.driver().allocate_memory(ctx.ctx_id(), &info) {
        Ok(handle) => handle,
        // The import fd and any fallback buffer are released with the transformed record.
        Err(VenusError::DriverError(code)) => return write_result(ctx, code),
        Err(e) => return Err(e),
    };

    let property_flags = ctx.driver().physical_device().memory_types
        [args.memory_type_index as usize]
        .property_flags;
    let mem = DeviceMemory {
        device_id: args.device_id,
        property_flags,
        valid_fd_types,
        allocation_size: args.allocation_size,
        memory_type_index: args.memory_type_index,
        gbm_buffer,
        exported: false,
        map_ptr: None,
    };
    ctx.objects.insert(VenusObject::new(
        args.memory_id,
        ObjectType::DeviceMemory,
        handle,
        ObjectPayload::DeviceMemory(mem),
    ))?;
    ctx.objects.track_child(args.device_id, args.memory_id);

    write_result(ctx, VENUS_SUCCESS)
}

fn free_memory(ctx: &VenusContext, args: venus_cmd_free_memory) -> VenusResult<()> {
    let is_memory = ctx
        .objects
        .with_object(args.memory_id, |obj| {
            obj.object_type == ObjectType::DeviceMemory
        })
        .unwrap_or(false);
    if !is_memory {
        return Err(VenusError::InvalidObjectId(args.memory_id));
    }

    let obj = ctx
        .objects
        .remove(args.memory_id)
        .ok_or(VenusError::InvalidObjectId(args.memory_id))?;
    ctx.run_object_destructor(obj);
    Ok(())
}
