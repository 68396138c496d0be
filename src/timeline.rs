// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! timeline: per-ring fence ordering domains bridging in-band ring seqnos with the host
//! driver's fencing.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::driver::Driver;
use crate::venus_utils::seqno_passed;
use crate::venus_utils::VenusError;
use crate::venus_utils::VenusFence;
use crate::venus_utils::VenusFenceHandler;
use crate::venus_utils::VenusResult;

pub const VENUS_TIMELINE_COUNT: u32 = 64;

struct Fence {
    flags: u32,
    seqno: u32,
    fence_id: u64,
}

#[derive(Default)]
struct Timeline {
    cur_seqno: u32,
    next_seqno: u32,
    fences: VecDeque<Fence>,
}

struct TimelineInner {
    timelines: Vec<Timeline>,
    /// Bit `i` set iff timeline `i` has any unretired fence.
    busy_mask: u64,
    free_fences: Vec<Fence>,
}

/// The 64 per-ring timelines of a context. Fences retire strictly in seqno order within a
/// timeline; there is no cross-timeline ordering.
pub struct TimelineSet {
    inner: Mutex<TimelineInner>,
}

impl TimelineSet {
    pub fn new() -> TimelineSet {
        let mut timelines = Vec::with_capacity(VENUS_TIMELINE_COUNT as usize);
        timelines.resize_with(VENUS_TIMELINE_COUNT as usize, Timeline::default);
        TimelineSet {
            inner: Mutex::new(TimelineInner {
                timelines,
                busy_mask: 0,
                free_fences: Vec::new(),
            }),
        }
    }

    /// Enqueues a fence and forwards it to the driver. On driver failure the timeline and
    /// busy mask are restored so no partial state escapes.
    pub fn submit(
        &self,
        ctx_id: u32,
        flags: u32,
        ring_idx: u32,
        fence_id: u64,
        driver: &dyn Driver,
    ) -> VenusResult<()> {
        if ring_idx >= VENUS_TIMELINE_COUNT {
            return Err(VenusError::InvalidRingIndex(ring_idx));
        }

        let seqno = {
            let mut inner = self.inner.lock().unwrap();
            let mut fence = inner.free_fences.pop().unwrap_or(Fence {
                flags: 0,
                seqno: 0,
                fence_id: 0,
            });
            let timeline = &mut inner.timelines[ring_idx as usize];
            fence.flags = flags;
            fence.seqno = timeline.next_seqno;
            fence.fence_id = fence_id;
            timeline.next_seqno = timeline.next_seqno.wrapping_add(1);
            let seqno = fence.seqno;
            timeline.fences.push_back(fence);
            inner.busy_mask |= 1 << ring_idx;
            seqno
        };

        // The driver call runs with the timeline guard dropped.
        match driver.submit_fence(ctx_id, flags, ring_idx, fence_id) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Recover the timeline fences and busy mask on submit failure.
                let mut inner = self.inner.lock().unwrap();
                let timeline = &mut inner.timelines[ring_idx as usize];
                if let Some(pos) = timeline.fences.iter().position(|f| f.seqno == seqno) {
                    let fence = timeline.fences.remove(pos).unwrap();
                    let empty = timeline.fences.is_empty();
                    inner.free_fences.push(fence);
                    if empty {
                        inner.busy_mask &= !(1 << ring_idx);
                    }
                }
                Err(e)
            }
        }
    }

    /// Advances a timeline to `seqno` and retires every in-order fence it signals. Runs
    /// the retire callback under the timeline guard so concurrent retirement paths cannot
    /// reorder a ring's callbacks.
    pub fn retire(&self, ctx_id: u32, ring_idx: u32, seqno: u32, retire_cb: &VenusFenceHandler) {
        if ring_idx >= VENUS_TIMELINE_COUNT {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        self.retire_locked(&mut inner, ctx_id, ring_idx, seqno, retire_cb);
    }

    /// Drains every busy timeline using the driver's current view of each ring's seqno.
    pub fn retire_all(&self, ctx_id: u32, driver: &dyn Driver, retire_cb: &VenusFenceHandler) {
        let mut inner = self.inner.lock().unwrap();
        let mut busy = inner.busy_mask;
        while busy != 0 {
            let ring_idx = busy.trailing_zeros();
            busy &= busy - 1;
            let seqno = driver.load_timeline_seqno(ctx_id, ring_idx);
            self.retire_locked(&mut inner, ctx_id, ring_idx, seqno, retire_cb);
        }
    }

    fn retire_locked(
        &self,
        inner: &mut TimelineInner,
        ctx_id: u32,
        ring_idx: u32,
        seqno: u32,
        retire_cb: &VenusFenceHandler,
    ) {
        inner.timelines[ring_idx as usize].cur_seqno = seqno;

        loop {
            let timeline = &mut inner.timelines[ring_idx as usize];
            let signaled = matches!(
                timeline.fences.front(),
                Some(fence) if seqno_passed(timeline.cur_seqno, fence.seqno)
            );
            if !signaled {
                break;
            }

            let fence = timeline.fences.pop_front().unwrap();
            retire_cb.call(VenusFence {
                flags: fence.flags,
                fence_id: fence.fence_id,
                ctx_id,
                ring_idx,
            });
            inner.free_fences.push(fence);
        }

        if inner.timelines[ring_idx as usize].fences.is_empty() {
            inner.busy_mask &= !(1 << ring_idx);
        }
    }

    #[cfg(test)]
    pub fn busy_mask(&self) -> u64 {
        self.inner.lock().unwrap().busy_mask
    }

    /// Seeds a timeline's seqno counters, for exercising wraparound.
    #[cfg(test)]
    pub fn seed_seqno(&self, ring_idx: u32, seqno: u32) {
        let mut inner = self.inner.lock().unwrap();
        let timeline = &mut inner.timelines[ring_idx as usize];
        timeline.cur_seqno = seqno;
        timeline.next_seqno = seqno;
    }
}

impl Default for TimelineSet {
    fn default() -> TimelineSet {
        TimelineSet::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;
    use crate::driver::test_support::FakeDriver;
    use crate::venus_utils::VenusHandler;
    use crate::venus_utils::VENUS_FLAG_FENCE;

    fn recording_handler() -> (VenusFenceHandler, Arc<Mutex<Vec<u64>>>) {
        let retired = Arc::new(Mutex::new(Vec::new()));
        let retired_clone = retired.clone();
        let handler = VenusHandler::new(move |fence: VenusFence| {
            retired_clone.lock().unwrap().push(fence.fence_id);
        });
        (handler, retired)
    }

    #[test]
    fn retires_in_order_even_when_driver_skips_ahead() {
        let driver = FakeDriver::new(FakeDriver::default_info());
        let timelines = TimelineSet::new();
        let (handler, retired) = recording_handler();

        for fence_id in [10u64, 11, 12] {
            timelines
                .submit(1, VENUS_FLAG_FENCE, 0, fence_id, driver.as_ref())
                .unwrap();
        }
        assert_eq!(timelines.busy_mask(), 1);

        // The driver reports completion of the last fence only; all three retire, in
        // submission order.
        timelines.retire(1, 0, 2, &handler);
        assert_eq!(*retired.lock().unwrap(), vec![10, 11, 12]);
        assert_eq!(timelines.busy_mask(), 0);
    }

    #[test]
    fn retire_stops_at_first_unsignaled_fence() {
        let driver = FakeDriver::new(FakeDriver::default_info());
        let timelines = TimelineSet::new();
        let (handler, retired) = recording_handler();

        for fence_id in [20u64, 21, 22] {
            timelines
                .submit(1, VENUS_FLAG_FENCE, 3, fence_id, driver.as_ref())
                .unwrap();
        }

        timelines.retire(1, 3, 1, &handler);
        assert_eq!(*retired.lock().unwrap(), vec![20, 21]);
        assert_eq!(timelines.busy_mask(), 1 << 3);

        timelines.retire(1, 3, 2, &handler);
        assert_eq!(*retired.lock().unwrap(), vec![20, 21, 22]);
        assert_eq!(timelines.busy_mask(), 0);
    }

    #[test]
    fn submit_failure_rolls_back_list_and_busy_mask() {
        let driver = FakeDriver::new(FakeDriver::default_info());
        let timelines = TimelineSet::new();

        *driver.fail_submit.lock().unwrap() = true;
        assert!(timelines
            .submit(1, VENUS_FLAG_FENCE, 0, 10, driver.as_ref())
            .is_err());
        assert_eq!(timelines.busy_mask(), 0);

        // The rolled-back fence does not leak a stale seqno: the next submit retires
        // normally.
        *driver.fail_submit.lock().unwrap() = false;
        let (handler, retired) = recording_handler();
        timelines
            .submit(1, VENUS_FLAG_FENCE, 0, 11, driver.as_ref())
            .unwrap();
        timelines.retire(1, 0, 1, &handler);
        assert_eq!(*retired.lock().unwrap(), vec![11]);
    }

    #[test]
    fn invalid_ring_index_rejected() {
        let driver = FakeDriver::new(FakeDriver::default_info());
        let timelines = TimelineSet::new();
        assert!(matches!(
            timelines.submit(1, VENUS_FLAG_FENCE, 64, 1, driver.as_ref()),
            Err(VenusError::InvalidRingIndex(64))
        ));
    }

    #[test]
    fn seqno_wraparound_keeps_retiring() {
        let driver = FakeDriver::new(FakeDriver::default_info());
        let timelines = TimelineSet::new();
        let (handler, retired) = recording_handler();

        // As if 2^32 - 2 fences had already been submitted and retired on this ring.
        timelines.seed_seqno(0, u32::MAX.wrapping_sub(1));

        for fence_id in [1u64, 2, 3, 4] {
            timelines
                .submit(1, VENUS_FLAG_FENCE, 0, fence_id, driver.as_ref())
                .unwrap();
        }

        // Retire across the wrap boundary: seqnos MAX-1, MAX, 0, 1.
        timelines.retire(1, 0, u32::MAX, &handler);
        assert_eq!(*retired.lock().unwrap(), vec![1, 2]);
        timelines.retire(1, 0, 1, &handler);
        assert_eq!(*retired.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(timelines.busy_mask(), 0);
    }

    #[test]
    fn retire_all_walks_busy_timelines_only() {
        let driver = FakeDriver::new(FakeDriver::default_info());
        let timelines = TimelineSet::new();
        let (handler, retired) = recording_handler();

        timelines
            .submit(1, VENUS_FLAG_FENCE, 0, 100, driver.as_ref())
            .unwrap();
        timelines
            .submit(1, VENUS_FLAG_FENCE, 5, 200, driver.as_ref())
            .unwrap();
        assert_eq!(timelines.busy_mask(), (1 << 0) | (1 << 5));

        // Ring 0 is complete per the driver's shared seqnos; ring 5 is not.
        driver.timeline_seqnos.lock().unwrap()[0] = 1;
        timelines.retire_all(1, driver.as_ref(), &handler);
        assert_eq!(*retired.lock().unwrap(), vec![100]);
        assert_eq!(timelines.busy_mask(), 1 << 5);
    }
}
