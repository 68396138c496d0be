// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! renderer: the process-wide surface handed to the embedding transport.
//!
//! Contexts live in an owned registry keyed by context id; the driver's asynchronous
//! retirement path resolves contexts through the same registry and holds a non-owning
//! reference only for the duration of the callback.

use std::collections::BTreeMap as Map;
use std::sync::Arc;
use std::sync::Mutex;

use log::error;

use crate::context::VenusContext;
use crate::driver::Driver;
use crate::driver::GbmDevice;
use crate::venus_os::OwnedDescriptor;
use crate::venus_utils::ResourceFdType;
use crate::venus_utils::VenusBlob;
use crate::venus_utils::VenusError;
use crate::venus_utils::VenusFence;
use crate::venus_utils::VenusFenceHandler;
use crate::venus_utils::VenusHandler;
use crate::venus_utils::VenusResult;

struct RendererInner {
    driver: Arc<dyn Driver>,
    gbm: Option<Arc<dyn GbmDevice>>,
    contexts: Mutex<Map<u32, Arc<VenusContext>>>,
}

impl RendererInner {
    fn ctx(&self, ctx_id: u32) -> VenusResult<Arc<VenusContext>> {
        self.contexts
            .lock()
            .unwrap()
            .get(&ctx_id)
            .cloned()
            .ok_or(VenusError::InvalidContextId(ctx_id))
    }

    fn retire_fence(&self, ctx_id: u32, ring_idx: u32, fence_id: u64) {
        match self.ctx(ctx_id) {
            // The protocol guarantees the low 32 bits of the fence id observed here are
            // the ring seqno the driver reached.
            Ok(ctx) => ctx.retire_fences(ring_idx, fence_id as u32),
            // The driver's async thread must keep running; a stale retirement is dropped.
            Err(_) => error!("fence retirement for unknown ctx {}", ctx_id),
        }
    }
}

impl Drop for RendererInner {
    fn drop(&mut self) {
        let contexts = std::mem::take(&mut *self.contexts.lock().unwrap());
        for ctx in contexts.values() {
            ctx.destroy();
        }
    }
}

/// Renderer builder, following the builder pattern.
pub struct RendererBuilder {
    driver: Arc<dyn Driver>,
    gbm: Option<Arc<dyn GbmDevice>>,
}

impl RendererBuilder {
    pub fn new(driver: Arc<dyn Driver>) -> RendererBuilder {
        RendererBuilder { driver, gbm: None }
    }

    /// Installs the process-global fallback buffer allocator.
    pub fn set_gbm_device(mut self, gbm: Arc<dyn GbmDevice>) -> RendererBuilder {
        self.gbm = Some(gbm);
        self
    }

    pub fn build(self) -> Renderer {
        Renderer {
            inner: Arc::new(RendererInner {
                driver: self.driver,
                gbm: self.gbm,
                contexts: Mutex::new(Map::new()),
            }),
        }
    }
}

/// The embedding surface. Clones share one context registry.
#[derive(Clone)]
pub struct Renderer {
    inner: Arc<RendererInner>,
}

impl Renderer {
    /// Creates a context and registers it in the process-wide table.
    pub fn create_context(
        &self,
        ctx_id: u32,
        debug_name: &str,
        retire_cb: VenusFenceHandler,
    ) -> VenusResult<()> {
        let mut contexts = self.inner.contexts.lock().unwrap();
        if contexts.contains_key(&ctx_id) {
            return Err(VenusError::InvalidContextId(ctx_id));
        }
        let ctx = VenusContext::new(
            ctx_id,
            debug_name,
            retire_cb,
            self.inner.driver.clone(),
            self.inner.gbm.clone(),
        );
        contexts.insert(ctx_id, ctx);
        Ok(())
    }

    /// Removes the context from the table and tears it down. No further retirement
    /// callbacks are delivered for it.
    pub fn destroy_context(&self, ctx_id: u32) -> VenusResult<()> {
        let ctx = self
            .inner
            .contexts
            .lock()
            .unwrap()
            .remove(&ctx_id)
            .ok_or(VenusError::InvalidContextId(ctx_id))?;
        ctx.destroy();
        Ok(())
    }

    pub fn submit_cmd(&self, ctx_id: u32, buffer: &[u8]) -> VenusResult<()> {
        self.inner.ctx(ctx_id)?.submit_cmd(buffer)
    }

    pub fn submit_fence(
        &self,
        ctx_id: u32,
        flags: u32,
        ring_idx: u32,
        fence_id: u64,
    ) -> VenusResult<()> {
        self.inner.ctx(ctx_id)?.submit_fence(flags, ring_idx, fence_id)
    }

    pub fn create_resource(
        &self,
        ctx_id: u32,
        res_id: u32,
        blob_id: u64,
        blob_size: u64,
        blob_flags: u32,
    ) -> VenusResult<VenusBlob> {
        self.inner
            .ctx(ctx_id)?
            .create_resource(res_id, blob_id, blob_size, blob_flags)
    }

    pub fn import_resource(
        &self,
        ctx_id: u32,
        res_id: u32,
        fd_type: ResourceFdType,
        descriptor: Option<OwnedDescriptor>,
        size: u64,
    ) -> VenusResult<()> {
        self.inner
            .ctx(ctx_id)?
            .import_resource(res_id, fd_type, descriptor, size)
    }

    pub fn destroy_resource(&self, ctx_id: u32, res_id: u32) -> VenusResult<()> {
        self.inner.ctx(ctx_id)?.destroy_resource(res_id);
        Ok(())
    }

    pub fn ring_monitor_init(&self, ctx_id: u32, report_period_us: u32) -> VenusResult<()> {
        self.inner.ctx(ctx_id)?.ring_monitor_init(report_period_us)
    }

    /// Called by the transport when it observes a guest head advance.
    pub fn on_ring_seqno_update(
        &self,
        ctx_id: u32,
        ring_id: u64,
        ring_seqno: u64,
    ) -> VenusResult<()> {
        self.inner
            .ctx(ctx_id)?
            .on_ring_seqno_update(ring_id, ring_seqno);
        Ok(())
    }

    /// Blocks until the ring head passes the target; false if aborted by teardown.
    pub fn wait_ring_seqno(&self, ctx_id: u32, ring_id: u64, ring_seqno: u64) -> VenusResult<bool> {
        self.inner.ctx(ctx_id)?.wait_ring_seqno(ring_id, ring_seqno)
    }

    /// Periodic host-side drain of all busy timelines.
    pub fn retire_all(&self, ctx_id: u32) -> VenusResult<()> {
        self.inner.ctx(ctx_id)?.retire_all();
        Ok(())
    }

    /// Driver completion entry: retires fences on the context's timeline. Unknown
    /// contexts are logged and dropped so the driver thread keeps running.
    pub fn retire_fence(&self, ctx_id: u32, ring_idx: u32, fence_id: u64) {
        self.inner.retire_fence(ctx_id, ring_idx, fence_id);
    }

    /// Handler form of `retire_fence`, for drivers that take a completion callback.
    pub fn retire_handler(&self) -> VenusFenceHandler {
        let weak = Arc::downgrade(&self.inner);
        VenusHandler::new(move |fence: VenusFence| {
            if let Some(inner) = weak.upgrade() {
                inner.retire_fence(fence.ctx_id, fence.ring_idx, fence.fence_id);
            }
        })
    }
}
