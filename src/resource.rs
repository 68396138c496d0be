// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! resource: the per-context registry of transport-visible blobs.

use std::collections::BTreeMap as Map;
use std::sync::Arc;
use std::sync::Mutex;

use crate::venus_os::MemoryMapping;
use crate::venus_os::OwnedDescriptor;
use crate::venus_utils::ResourceFdType;
use crate::venus_utils::VenusError;
use crate::venus_utils::VenusResult;

/// Backing storage of a resource. Shm resources are mapped; fd-backed resources keep the
/// owned descriptor, which is dup'd whenever another holder needs it.
pub enum ResourceStorage {
    None,
    Descriptor(OwnedDescriptor),
    Mapping(Arc<MemoryMapping>),
}

/// A guest-visible resource, valid from create/import until destroy.
pub struct VenusResource {
    pub res_id: u32,
    pub blob_id: u64,
    pub fd_type: ResourceFdType,
    pub storage: ResourceStorage,
    pub size: u64,
}

impl VenusResource {
    /// Builds a resource from an imported descriptor, mapping it when the transport hands
    /// over shared memory. Takes ownership of the descriptor; dropping the resource is the
    /// single release of the fd or mapping.
    pub fn from_import(
        res_id: u32,
        fd_type: ResourceFdType,
        descriptor: Option<OwnedDescriptor>,
        size: u64,
    ) -> VenusResult<VenusResource> {
        let storage = match (fd_type, descriptor) {
            (ResourceFdType::Shm, Some(descriptor)) => {
                let mapping = MemoryMapping::from_descriptor(&descriptor, size.try_into()?)?;
                ResourceStorage::Mapping(Arc::new(mapping))
            }
            (ResourceFdType::Shm, None) => {
                return Err(VenusError::SpecViolation("shm import without descriptor"))
            }
            (ResourceFdType::None, _) => ResourceStorage::None,
            (_, Some(descriptor)) => ResourceStorage::Descriptor(descriptor),
            (_, None) => ResourceStorage::None,
        };

        Ok(VenusResource {
            res_id,
            blob_id: 0,
            fd_type,
            storage,
            size,
        })
    }
}

/// Maps resource id to blob descriptor. All entry points serialize on one guard.
#[derive(Default)]
pub struct ResourceTable {
    resources: Mutex<Map<u32, VenusResource>>,
}

impl ResourceTable {
    pub fn new() -> ResourceTable {
        Default::default()
    }

    /// Adds a resource. A second create or import with the same id is a protocol error.
    pub fn add(&self, resource: VenusResource) -> VenusResult<()> {
        let mut resources = self.resources.lock().unwrap();
        if resources.contains_key(&resource.res_id) {
            return Err(VenusError::SpecViolation("duplicate resource id"));
        }
        resources.insert(resource.res_id, resource);
        Ok(())
    }

    /// Removes a resource, releasing its fd or mapping exactly once via drop. Unknown ids
    /// are a no-op.
    pub fn remove(&self, res_id: u32) -> Option<VenusResource> {
        self.resources.lock().unwrap().remove(&res_id)
    }

    pub fn contains(&self, res_id: u32) -> bool {
        self.resources.lock().unwrap().contains_key(&res_id)
    }

    pub fn len(&self) -> usize {
        self.resources.lock().unwrap().len()
    }

    /// Duplicates the resource's fd for a caller that shares it beyond this call.
    pub fn dup_descriptor(&self, res_id: u32) -> VenusResult<(ResourceFdType, OwnedDescriptor)> {
        let resources = self.resources.lock().unwrap();
        let resource = resources
            .get(&res_id)
            .ok_or(VenusError::InvalidResourceId(res_id))?;
        match &resource.storage {
            ResourceStorage::Descriptor(descriptor) => {
                Ok((resource.fd_type, descriptor.try_clone()?))
            }
            _ => Err(VenusError::Unsupported),
        }
    }

    /// Returns the mapping of an shm resource.
    pub fn mapping(&self, res_id: u32) -> VenusResult<Arc<MemoryMapping>> {
        let resources = self.resources.lock().unwrap();
        let resource = resources
            .get(&res_id)
            .ok_or(VenusError::InvalidResourceId(res_id))?;
        match &resource.storage {
            ResourceStorage::Mapping(mapping) => Ok(mapping.clone()),
            _ => Err(VenusError::SpecViolation("resource is not shared memory")),
        }
    }

    /// Drops every resource at context teardown.
    pub fn clear(&self) {
        self.resources.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venus_os::SharedMemory;

    #[test]
    fn import_then_destroy_restores_table() {
        let table = ResourceTable::new();
        assert_eq!(table.len(), 0);

        let shm: OwnedDescriptor = SharedMemory::new("res", 4096).unwrap().into();
        let resource =
            VenusResource::from_import(3, ResourceFdType::Shm, Some(shm), 4096).unwrap();
        table.add(resource).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.contains(3));

        table.remove(3);
        assert_eq!(table.len(), 0);
        assert!(!table.contains(3));

        // Destroy on an unknown id is a no-op.
        assert!(table.remove(3).is_none());
    }

    #[test]
    fn duplicate_id_rejected() {
        let table = ResourceTable::new();
        table
            .add(VenusResource::from_import(7, ResourceFdType::None, None, 0).unwrap())
            .unwrap();
        let second = VenusResource::from_import(7, ResourceFdType::None, None, 0).unwrap();
        assert!(table.add(second).is_err());
    }

    #[test]
    fn shm_import_requires_descriptor_and_maps() {
        assert!(VenusResource::from_import(1, ResourceFdType::Shm, None, 4096).is_err());

        let table = ResourceTable::new();
        let shm: OwnedDescriptor = SharedMemory::new("res", 4096).unwrap().into();
        table
            .add(VenusResource::from_import(1, ResourceFdType::Shm, Some(shm), 4096).unwrap())
            .unwrap();

        let mapping = table.mapping(1).unwrap();
        assert_eq!(mapping.size(), 4096);
        // Non-shm lookups refuse to hand out a mapping.
        assert!(table.dup_descriptor(1).is_err());
    }

    #[test]
    fn dup_leaves_original_open() {
        let table = ResourceTable::new();
        let shm: OwnedDescriptor = SharedMemory::new("res", 4096).unwrap().into();
        let raw = shm.as_raw_descriptor();
        table
            .add(
                VenusResource::from_import(9, ResourceFdType::DmaBuf, Some(shm), 4096).unwrap(),
            )
            .unwrap();

        let (fd_type, dup) = table.dup_descriptor(9).unwrap();
        assert_eq!(fd_type, ResourceFdType::DmaBuf);
        assert_ne!(dup.as_raw_descriptor(), raw);

        // The registry still owns a live descriptor after the dup is dropped.
        drop(dup);
        assert_eq!(table.dup_descriptor(9).unwrap().0, ResourceFdType::DmaBuf);
    }
}
