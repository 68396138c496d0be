// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! context: the per-context renderer engine owning every registry and lock.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use log::error;
use log::warn;

use crate::codec::ReplyStream;
use crate::device_memory::export_blob;
use crate::device_memory::DeviceMemory;
use crate::dispatch::process_cmd_stream;
use crate::driver::Driver;
use crate::driver::GbmDevice;
use crate::object::ObjectPayload;
use crate::object::ObjectTable;
use crate::object::VenusObject;
use crate::resource::ResourceStorage;
use crate::resource::ResourceTable;
use crate::resource::VenusResource;
use crate::ring::RingMonitor;
use crate::ring::RingSet;
use crate::timeline::TimelineSet;
use crate::venus_os::OwnedDescriptor;
use crate::venus_utils::ResourceFdType;
use crate::venus_utils::VenusBlob;
use crate::venus_utils::VenusError;
use crate::venus_utils::VenusFenceHandler;
use crate::venus_utils::VenusResult;

/// A per-context renderer. Three thread classes touch a context: the dispatch thread, the
/// optional ring monitor, and the driver's async retirement thread.
pub struct VenusContext {
    ctx_id: u32,
    debug_name: String,
    driver: Arc<dyn Driver>,
    gbm: Option<Arc<dyn GbmDevice>>,
    retire_cb: VenusFenceHandler,
    /// Sticky; once the guest violates the protocol the context refuses further dispatch.
    fatal: AtomicBool,
    pub(crate) resources: ResourceTable,
    pub(crate) objects: ObjectTable,
    pub(crate) rings: RingSet,
    monitor: RingMonitor,
    pub(crate) timelines: TimelineSet,
    pub(crate) reply: Mutex<Option<ReplyStream>>,
}

impl VenusContext {
    pub(crate) fn new(
        ctx_id: u32,
        debug_name: &str,
        retire_cb: VenusFenceHandler,
        driver: Arc<dyn Driver>,
        gbm: Option<Arc<dyn GbmDevice>>,
    ) -> Arc<VenusContext> {
        Arc::new(VenusContext {
            ctx_id,
            debug_name: debug_name.to_string(),
            driver,
            gbm,
            retire_cb,
            fatal: AtomicBool::new(false),
            resources: ResourceTable::new(),
            objects: ObjectTable::new(),
            rings: RingSet::new(),
            monitor: RingMonitor::new(),
            timelines: TimelineSet::new(),
            reply: Mutex::new(None),
        })
    }

    pub fn ctx_id(&self) -> u32 {
        self.ctx_id
    }

    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub fn fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    pub(crate) fn set_fatal(&self) {
        if !self.fatal.swap(true, Ordering::Relaxed) {
            warn!(
                "ctx {} ({}) entered fatal state",
                self.ctx_id, self.debug_name
            );
        }
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub(crate) fn gbm(&self) -> Option<&dyn GbmDevice> {
        self.gbm.as_deref()
    }

    /// Dispatches a batch of framed commands. A zero-size batch is a successful no-op.
    pub fn submit_cmd(&self, buffer: &[u8]) -> VenusResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        if self.fatal() {
            return Err(VenusError::ContextFatal);
        }
        process_cmd_stream(self, buffer)
    }

    /// Enqueues a fence on the given timeline and forwards it to the driver.
    pub fn submit_fence(&self, flags: u32, ring_idx: u32, fence_id: u64) -> VenusResult<()> {
        if self.fatal() {
            return Err(VenusError::ContextFatal);
        }
        self.timelines
            .submit(self.ctx_id, flags, ring_idx, fence_id, self.driver.as_ref())
    }

    /// Driver completion path: advances the timeline to the observed seqno and retires
    /// every fence it signals, in order.
    pub fn retire_fences(&self, ring_idx: u32, seqno: u32) {
        self.timelines
            .retire(self.ctx_id, ring_idx, seqno, &self.retire_cb);
    }

    /// Host-side drain: retires fences on every busy timeline from the driver's shared
    /// seqno region.
    pub fn retire_all(&self) {
        self.timelines
            .retire_all(self.ctx_id, self.driver.as_ref(), &self.retire_cb);
    }

    /// Exports the device memory registered under `blob_id` as the resource `res_id`.
    pub fn create_resource(
        &self,
        res_id: u32,
        blob_id: u64,
        blob_size: u64,
        blob_flags: u32,
    ) -> VenusResult<VenusBlob> {
        if self.fatal() {
            return Err(VenusError::ContextFatal);
        }
        let result = self.create_resource_inner(res_id, blob_id, blob_size, blob_flags);
        if let Err(e) = &result {
            match e {
                VenusError::AlreadyExported
                | VenusError::InvalidObjectId(_)
                | VenusError::SpecViolation(_) => self.set_fatal(),
                _ => {}
            }
        }
        result
    }

    fn create_resource_inner(
        &self,
        res_id: u32,
        blob_id: u64,
        blob_size: u64,
        blob_flags: u32,
    ) -> VenusResult<VenusBlob> {
        if self.resources.contains(res_id) {
            error!("can't create res {}: id already in use", res_id);
            return Err(VenusError::SpecViolation("duplicate resource id"));
        }

        let (handle, mut mem) = self.take_device_memory(blob_id)?;
        let result = export_blob(
            &mut mem,
            handle,
            self.ctx_id,
            self.driver.as_ref(),
            blob_size,
            blob_flags,
        );
        self.put_device_memory(blob_id, mem);
        let blob = result?;

        let storage = match &blob.descriptor {
            Some(descriptor) => ResourceStorage::Descriptor(descriptor.try_clone()?),
            None => ResourceStorage::None,
        };
        self.resources.add(VenusResource {
            res_id,
            blob_id,
            fd_type: blob.fd_type,
            storage,
            size: blob_size,
        })?;

        Ok(blob)
    }

    /// Imports a transport resource, taking ownership of the descriptor. Shared memory is
    /// mapped immediately.
    pub fn import_resource(
        &self,
        res_id: u32,
        fd_type: ResourceFdType,
        descriptor: Option<OwnedDescriptor>,
        size: u64,
    ) -> VenusResult<()> {
        if self.fatal() {
            return Err(VenusError::ContextFatal);
        }
        let resource = VenusResource::from_import(res_id, fd_type, descriptor, size)
            .map_err(|e| {
                self.set_fatal();
                e
            })?;
        self.resources.add(resource).map_err(|e| {
            error!("failed to import res {}: id already in use", res_id);
            self.set_fatal();
            e
        })
    }

    /// Destroys a resource; unknown ids are a no-op.
    pub fn destroy_resource(&self, res_id: u32) {
        self.resources.remove(res_id);
    }

    /// Starts the ring monitor. The period is the minimum of all rings' configured max
    /// reporting periods, fixed for the lifetime of the context.
    pub fn ring_monitor_init(self: Arc<Self>, report_period_us: u32) -> VenusResult<()> {
        if self.fatal() {
            return Err(VenusError::ContextFatal);
        }
        let weak: Weak<VenusContext> = Arc::downgrade(&self);
        self.monitor.init(report_period_us, move || {
            let Some(ctx) = weak.upgrade() else {
                return false;
            };
            for ring_id in ctx.rings.monitored_ids() {
                ctx.driver.mark_ring_alive(ctx.ctx_id, ring_id);
            }
            true
        })
    }

    /// Transport notification that the guest advanced a ring head.
    pub fn on_ring_seqno_update(&self, ring_id: u64, ring_seqno: u64) {
        self.rings.on_head_update(ring_id, ring_seqno);
    }

    /// Blocks the dispatch thread until the ring head passes the target seqno. Returns
    /// false if the wait was aborted by context teardown.
    pub fn wait_ring_seqno(&self, ring_id: u64, ring_seqno: u64) -> VenusResult<bool> {
        if self.fatal() {
            return Err(VenusError::ContextFatal);
        }
        // A bad ring reference or a second concurrent wait is a protocol violation.
        self.rings.wait_seqno(ring_id, ring_seqno).map_err(|e| {
            self.set_fatal();
            e
        })
    }

    /// Moves the device-memory state out of the object table so driver calls can run with
    /// the table guard dropped. Only the dispatch thread mutates objects, so the window is
    /// not observable.
    pub(crate) fn take_device_memory(&self, id: u64) -> VenusResult<(u64, DeviceMemory)> {
        self.objects
            .with_object(id, |obj| {
                match std::mem::replace(&mut obj.payload, ObjectPayload::None) {
                    ObjectPayload::DeviceMemory(mem) => Some((obj.handle, mem)),
                    other => {
                        obj.payload = other;
                        None
                    }
                }
            })
            .flatten()
            .ok_or_else(|| {
                error!("invalid device memory id {}", id);
                VenusError::InvalidObjectId(id)
            })
    }

    pub(crate) fn put_device_memory(&self, id: u64, mem: DeviceMemory) {
        self.objects.with_object(id, |obj| {
            obj.payload = ObjectPayload::DeviceMemory(mem);
        });
    }

    /// Applies the type-tagged destructor. Runs with no table guard held.
    pub(crate) fn run_object_destructor(&self, obj: VenusObject) {
        match obj.payload {
            ObjectPayload::DeviceMemory(ref mem) => {
                if mem.map_ptr.is_some() {
                    self.driver.unmap_memory(self.ctx_id, obj.handle);
                }
                self.driver.free_memory(self.ctx_id, obj.handle);
                // The gbm buffer, if any, is released when the payload drops.
            }
            _ => self
                .driver
                .destroy_object(self.ctx_id, obj.object_type, obj.handle),
        }
    }

    /// Tears the context down: stops the monitor, aborts any outstanding wait, then
    /// destroys objects in reverse-dependency order and drops all resources. Runs to
    /// completion even when the context is fatal.
    pub(crate) fn destroy(&self) {
        self.monitor.stop();
        self.rings.shutdown();

        for obj in self.objects.drain_reverse() {
            self.run_object_destructor(obj);
        }

        self.resources.clear();
        *self.reply.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_support::FakeDriver;
    use crate::object::ObjectType;
    use crate::venus_utils::VenusHandler;

    fn new_context(driver: Arc<FakeDriver>) -> Arc<VenusContext> {
        VenusContext::new(1, "test", VenusHandler::new(|_| {}), driver, None)
    }

    #[test]
    fn zero_size_submit_is_a_noop() {
        let driver = FakeDriver::new(FakeDriver::default_info());
        let ctx = new_context(driver);
        ctx.submit_cmd(&[]).unwrap();
        assert!(!ctx.fatal());
    }

    #[test]
    fn fatal_flag_never_clears() {
        let driver = FakeDriver::new(FakeDriver::default_info());
        let ctx = new_context(driver);

        ctx.set_fatal();
        assert!(ctx.fatal());
        ctx.set_fatal();
        assert!(ctx.fatal());

        assert!(matches!(
            ctx.submit_cmd(&[0u8; 8]),
            Err(VenusError::ContextFatal)
        ));
        assert!(matches!(
            ctx.submit_fence(0, 0, 1),
            Err(VenusError::ContextFatal)
        ));
    }

    #[test]
    fn destroy_runs_each_destructor_exactly_once() {
        let driver = FakeDriver::new(FakeDriver::default_info());
        let ctx = new_context(driver.clone());

        let instance = driver.create_object(1, ObjectType::Instance).unwrap();
        ctx.objects
            .insert(VenusObject::new(
                10,
                ObjectType::Instance,
                instance,
                ObjectPayload::None,
            ))
            .unwrap();
        let buffer = driver.create_object(1, ObjectType::Buffer).unwrap();
        ctx.objects
            .insert(VenusObject::new(
                11,
                ObjectType::Buffer,
                buffer,
                ObjectPayload::None,
            ))
            .unwrap();

        ctx.destroy();
        let log = driver.log.lock().unwrap();
        // Reverse creation order: the buffer goes before the instance.
        assert_eq!(
            log.destroyed_objects,
            vec![(ObjectType::Buffer, buffer), (ObjectType::Instance, instance)]
        );
        drop(log);

        // A second teardown finds nothing left to destroy.
        ctx.destroy();
        assert_eq!(driver.log.lock().unwrap().destroyed_objects.len(), 2);
    }

    #[test]
    fn destroy_still_cleans_up_fatal_context() {
        let driver = FakeDriver::new(FakeDriver::default_info());
        let ctx = new_context(driver.clone());

        let handle = driver.create_object(1, ObjectType::Image).unwrap();
        ctx.objects
            .insert(VenusObject::new(
                5,
                ObjectType::Image,
                handle,
                ObjectPayload::None,
            ))
            .unwrap();
        ctx.import_resource(3, ResourceFdType::None, None, 0).unwrap();

        ctx.set_fatal();
        ctx.destroy();

        assert_eq!(driver.log.lock().unwrap().destroyed_objects.len(), 1);
        assert!(!ctx.resources.contains(3));
    }
}
