// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! codec: iterates framed commands out of a submitted buffer and writes replies back to
//! guest-visible memory.

use std::mem::size_of;
use std::sync::Arc;

use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::protocol::venus_cmd_hdr;
use crate::venus_os::MemoryMapping;
use crate::venus_utils::VenusError;
use crate::venus_utils::VenusResult;

/// A single decoded frame. The payload view is only valid for the duration of the handler
/// call; handlers must copy anything they retain.
pub struct Frame<'slice> {
    pub opcode: u32,
    payload: &'slice [u8],
}

impl<'slice> Frame<'slice> {
    /// Reads and consumes the command's argument record from the frame payload.
    pub fn read_args<T: FromBytes>(&mut self) -> VenusResult<T> {
        let args = T::read_from_prefix(self.payload)
            .ok_or(VenusError::SpecViolation("command payload too short"))?;
        self.payload = &self.payload[size_of::<T>()..];
        Ok(args)
    }
}

/// Decoder owning a read cursor over a contiguous command buffer.
pub struct Decoder<'slice> {
    data: &'slice [u8],
    offset: usize,
}

impl<'slice> Decoder<'slice> {
    pub fn new(data: &'slice [u8]) -> Decoder<'slice> {
        Decoder { data, offset: 0 }
    }

    /// Returns the next frame, `None` at end of buffer, or an error on a truncated or
    /// malformed frame. Decode errors are unrecoverable for the buffer.
    pub fn next_frame(&mut self) -> VenusResult<Option<Frame<'slice>>> {
        if self.offset == self.data.len() {
            return Ok(None);
        }

        let remaining = &self.data[self.offset..];
        let hdr = venus_cmd_hdr::read_from_prefix(remaining)
            .ok_or(VenusError::InvalidCommandSize(remaining.len()))?;

        let cmd_size = hdr.cmd_size as usize;
        if cmd_size < size_of::<venus_cmd_hdr>() || cmd_size > remaining.len() {
            return Err(VenusError::InvalidCommandSize(cmd_size));
        }

        let payload = &remaining[size_of::<venus_cmd_hdr>()..cmd_size];
        self.offset += cmd_size;

        Ok(Some(Frame {
            opcode: hdr.opcode,
            payload,
        }))
    }
}

/// Encoder appending reply records to a guest-visible region of a mapped resource.
pub struct ReplyStream {
    mapping: Arc<MemoryMapping>,
    offset: usize,
    size: usize,
    written: usize,
}

impl ReplyStream {
    pub fn new(mapping: Arc<MemoryMapping>, offset: u64, size: u64) -> VenusResult<ReplyStream> {
        let offset: usize = offset.try_into()?;
        let size: usize = size.try_into()?;
        let end = offset
            .checked_add(size)
            .ok_or(VenusError::SpecViolation("reply region overflows"))?;
        if end > mapping.size() {
            return Err(VenusError::SpecViolation(
                "reply region outside resource bounds",
            ));
        }

        Ok(ReplyStream {
            mapping,
            offset,
            size,
            written: 0,
        })
    }

    /// Appends a reply record. Overflowing the region is a protocol error.
    pub fn write_obj<T: AsBytes>(&mut self, val: T) -> VenusResult<()> {
        let bytes = val.as_bytes();
        if self.written + bytes.len() > self.size {
            return Err(VenusError::SpecViolation("reply region overflow"));
        }

        self.mapping
            .write_slice(self.offset + self.written, bytes)?;
        self.written += bytes.len();
        Ok(())
    }

    pub fn bytes_written(&self) -> usize {
        self.written
    }
}
