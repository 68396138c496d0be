// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! object: the per-context registry of driver-side object handles.
//!
//! Object ids are assigned by the guest; the guest is the sole source of ids, so a zero id
//! or a collision is a protocol error, not something to recover from.

use std::collections::BTreeMap as Map;
use std::sync::Mutex;

use log::error;

use crate::device_memory::DeviceMemory;
use crate::venus_utils::VenusError;
use crate::venus_utils::VenusResult;

/// Type tag of a driver object; selects the destructor applied on removal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ObjectType {
    Instance,
    Device,
    Queue,
    Semaphore,
    Fence,
    DeviceMemory,
    Buffer,
    Image,
}

impl ObjectType {
    pub fn from_raw(raw: u32) -> Option<ObjectType> {
        match raw {
            1 => Some(ObjectType::Instance),
            3 => Some(ObjectType::Device),
            4 => Some(ObjectType::Queue),
            5 => Some(ObjectType::Semaphore),
            7 => Some(ObjectType::Fence),
            8 => Some(ObjectType::DeviceMemory),
            9 => Some(ObjectType::Buffer),
            10 => Some(ObjectType::Image),
            _ => None,
        }
    }
}

/// Type-specific state carried by an object.
pub enum ObjectPayload {
    None,
    /// Devices track the ids of their children for bulk removal.
    Device { children: Vec<u64> },
    DeviceMemory(DeviceMemory),
}

/// A driver-side handle tagged with its type and the guest-assigned id.
pub struct VenusObject {
    pub id: u64,
    pub object_type: ObjectType,
    pub handle: u64,
    pub payload: ObjectPayload,
    /// Creation order; children always come after their parents, so descending serial is
    /// reverse-dependency order at teardown.
    serial: u64,
}

impl VenusObject {
    pub fn new(id: u64, object_type: ObjectType, handle: u64, payload: ObjectPayload) -> Self {
        VenusObject {
            id,
            object_type,
            handle,
            payload,
            serial: 0,
        }
    }
}

#[derive(Default)]
struct TableInner {
    objects: Map<u64, VenusObject>,
    next_serial: u64,
}

/// Maps object id to object. Destructors never run under the table guard; removal hands
/// the object back to the caller, which applies the type-tagged destructor.
#[derive(Default)]
pub struct ObjectTable {
    inner: Mutex<TableInner>,
}

impl ObjectTable {
    pub fn new() -> ObjectTable {
        Default::default()
    }

    /// Returns true iff `id` is non-zero and unused. The caller marks the context fatal on
    /// failure; a collision means the guest violated the protocol.
    pub fn validate_id(&self, id: u64) -> bool {
        if id == 0 {
            error!("invalid object id 0");
            return false;
        }
        let inner = self.inner.lock().unwrap();
        if inner.objects.contains_key(&id) {
            error!("invalid object id {}", id);
            return false;
        }
        true
    }

    /// Inserts an object after a successful `validate_id`. A duplicate here is a renderer
    /// bug, not a guest error.
    pub fn insert(&self, mut obj: VenusObject) -> VenusResult<()> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(obj.id != 0 && !inner.objects.contains_key(&obj.id));
        if obj.id == 0 || inner.objects.contains_key(&obj.id) {
            error!("duplicate insert of object id {}", obj.id);
            return Err(VenusError::InvalidObjectId(obj.id));
        }
        inner.next_serial += 1;
        obj.serial = inner.next_serial;
        inner.objects.insert(obj.id, obj);
        Ok(())
    }

    /// Removes an object; the caller runs its destructor with the guard dropped.
    pub fn remove(&self, id: u64) -> Option<VenusObject> {
        self.inner.lock().unwrap().objects.remove(&id)
    }

    /// Removes a parent's tracked children atomically with respect to the table guard.
    /// Destructors are deferred to the caller, outside the critical region.
    pub fn remove_all(&self, ids: &[u64]) -> Vec<VenusObject> {
        let mut inner = self.inner.lock().unwrap();
        ids.iter()
            .filter_map(|id| inner.objects.remove(id))
            .collect()
    }

    /// Drains every object in reverse creation order for context teardown.
    pub fn drain_reverse(&self) -> Vec<VenusObject> {
        let mut inner = self.inner.lock().unwrap();
        let mut objects: Vec<VenusObject> =
            std::mem::take(&mut inner.objects).into_values().collect();
        objects.sort_by(|a, b| b.serial.cmp(&a.serial));
        objects
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().unwrap().objects.contains_key(&id)
    }

    /// Runs `f` against the object while the guard is held.
    pub fn with_object<R>(&self, id: u64, f: impl FnOnce(&mut VenusObject) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.objects.get_mut(&id).map(f)
    }

    /// Records `child` in its parent's tracking list.
    pub fn track_child(&self, parent_id: u64, child_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(parent) = inner.objects.get_mut(&parent_id) {
            if let ObjectPayload::Device { children } = &mut parent.payload {
                children.push(child_id);
            }
        }
    }
}
