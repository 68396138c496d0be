// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod descriptor;
mod mmap;
mod shm;

pub use descriptor::OwnedDescriptor;
pub use descriptor::RawDescriptor;
pub use mmap::MemoryMapping;
pub use shm::SharedMemory;
