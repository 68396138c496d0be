// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! ring: the context's set of protocol rings, seqno waits, and the liveness monitor.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use log::error;

use crate::venus_os::MemoryMapping;
use crate::venus_utils::seqno_passed;
use crate::venus_utils::VenusError;
use crate::venus_utils::VenusResult;

pub const VENUS_MAX_RINGS: usize = 64;

/// A shared-memory producer/consumer queue between guest and host. The guest advances the
/// head seqno in shared memory; the context only ever reads it.
pub struct Ring {
    pub ring_id: u64,
    mapping: Arc<MemoryMapping>,
    head_offset: usize,
    pub monitored: bool,
}

impl Ring {
    pub fn new(
        ring_id: u64,
        mapping: Arc<MemoryMapping>,
        head_offset: usize,
        monitored: bool,
    ) -> VenusResult<Ring> {
        if head_offset % 4 != 0 || head_offset + 4 > mapping.size() {
            return Err(VenusError::SpecViolation("ring head outside resource"));
        }
        Ok(Ring {
            ring_id,
            mapping,
            head_offset,
            monitored,
        })
    }

    /// Loads the guest-visible head seqno.
    pub fn head_seqno(&self) -> u32 {
        self.mapping.load_u32(self.head_offset)
    }
}

#[derive(Default)]
struct WaitState {
    active: bool,
    ring_id: u64,
    /// Head position being waited on. The protocol supports 64-bit seqnos; only the low 32
    /// bits are used internally since the head-to-target delta never exceeds the ring size.
    seqno: u32,
    shutdown: bool,
}

/// The context's ring set. One guard covers the ring list; waiter bookkeeping has its own
/// guard and condition, and neither is ever held across a driver call.
#[derive(Default)]
pub struct RingSet {
    rings: Mutex<Vec<Ring>>,
    wait: Mutex<WaitState>,
    wait_cond: Condvar,
}

impl RingSet {
    pub fn new() -> RingSet {
        Default::default()
    }

    pub fn attach(&self, ring: Ring) -> VenusResult<()> {
        let mut rings = self.rings.lock().unwrap();
        if rings.len() >= VENUS_MAX_RINGS {
            return Err(VenusError::SpecViolation("too many rings"));
        }
        if rings.iter().any(|r| r.ring_id == ring.ring_id) {
            return Err(VenusError::SpecViolation("duplicate ring id"));
        }
        rings.push(ring);
        Ok(())
    }

    pub fn detach(&self, ring_id: u64) -> VenusResult<()> {
        let mut rings = self.rings.lock().unwrap();
        match rings.iter().position(|r| r.ring_id == ring_id) {
            Some(pos) => {
                rings.remove(pos);
                Ok(())
            }
            None => Err(VenusError::InvalidRingId(ring_id)),
        }
    }

    fn head_seqno(&self, ring_id: u64) -> VenusResult<u32> {
        let rings = self.rings.lock().unwrap();
        rings
            .iter()
            .find(|r| r.ring_id == ring_id)
            .map(Ring::head_seqno)
            .ok_or(VenusError::InvalidRingId(ring_id))
    }

    pub fn monitored_ids(&self) -> Vec<u64> {
        self.rings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.monitored)
            .map(|r| r.ring_id)
            .collect()
    }

    /// Called by the transport when it observes a guest head advance. Wakes the waiter if
    /// the update is for its ring and reaches its target.
    pub fn on_head_update(&self, ring_id: u64, seqno: u64) {
        let wait = self.wait.lock().unwrap();
        if wait.active && wait.ring_id == ring_id && seqno_passed(seqno as u32, wait.seqno) {
            self.wait_cond.notify_one();
        }
    }

    /// Blocks the dispatch thread until the ring head passes `seqno` or the context shuts
    /// down. Returns false on shutdown. Only one ring may be waited on at a time.
    pub fn wait_seqno(&self, ring_id: u64, seqno: u64) -> VenusResult<bool> {
        let target = seqno as u32;
        let mut wait = self.wait.lock().unwrap();
        if wait.active {
            // The dispatch thread is the only waiter, so a second wait is a renderer bug.
            debug_assert!(!wait.active);
            error!("ring wait started while another wait is active");
            return Err(VenusError::SpecViolation("concurrent ring waits"));
        }
        wait.active = true;
        wait.ring_id = ring_id;
        wait.seqno = target;

        let passed = loop {
            if wait.shutdown {
                break false;
            }
            match self.head_seqno(ring_id) {
                Ok(head) if seqno_passed(head, target) => break true,
                Ok(_) => {}
                Err(e) => {
                    wait.active = false;
                    return Err(e);
                }
            }
            // Spurious wakeups just recheck the head.
            wait = self.wait_cond.wait(wait).unwrap();
        };

        wait.active = false;
        Ok(passed)
    }

    /// Aborts any outstanding wait; part of context teardown.
    pub fn shutdown(&self) {
        let mut wait = self.wait.lock().unwrap();
        wait.shutdown = true;
        self.wait_cond.notify_all();
    }
}

struct MonitorInner {
    shutdown: bool,
    handle: Option<JoinHandle<()>>,
}

struct MonitorShared {
    inner: Mutex<MonitorInner>,
    cond: Condvar,
}

/// Single background worker that periodically marks all attached rings alive before the
/// host-level watchdog fires. Started lazily; joined at context teardown.
pub struct RingMonitor {
    shared: Arc<MonitorShared>,
}

impl RingMonitor {
    pub fn new() -> RingMonitor {
        RingMonitor {
            shared: Arc::new(MonitorShared {
                inner: Mutex::new(MonitorInner {
                    shutdown: false,
                    handle: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Starts the monitor thread. The reporting period is fixed for the lifetime of the
    /// monitor; callers derive it from the minimum of all rings' configured maximums.
    pub fn init<F>(&self, report_period_us: u32, mark_alive: F) -> VenusResult<()>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.handle.is_some() {
            return Err(VenusError::SpecViolation("ring monitor already started"));
        }

        let shared = self.shared.clone();
        let period = Duration::from_micros(report_period_us as u64);
        let handle = thread::Builder::new()
            .name("venus_ring_monitor".into())
            .spawn(move || {
                let mut inner = shared.inner.lock().unwrap();
                loop {
                    if inner.shutdown {
                        break;
                    }
                    let (guard, _) = shared.cond.wait_timeout(inner, period).unwrap();
                    inner = guard;
                    if inner.shutdown {
                        break;
                    }
                    drop(inner);
                    if !mark_alive() {
                        return;
                    }
                    inner = shared.inner.lock().unwrap();
                }
            })?;
        inner.handle = Some(handle);
        Ok(())
    }

    /// Stops and joins the monitor thread, if it was started.
    pub fn stop(&self) {
        let handle = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.shutdown = true;
            self.shared.cond.notify_all();
            inner.handle.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    use super::*;
    use crate::venus_os::OwnedDescriptor;
    use crate::venus_os::SharedMemory;

    fn ring_mapping() -> Arc<MemoryMapping> {
        let shm: OwnedDescriptor = SharedMemory::new("ring", 4096).unwrap().into();
        Arc::new(MemoryMapping::from_descriptor(&shm, 4096).unwrap())
    }

    fn write_head(mapping: &MemoryMapping, offset: usize, value: u32) {
        mapping.write_slice(offset, &value.to_ne_bytes()).unwrap();
    }

    #[test]
    fn attach_limits_and_duplicates() {
        let rings = RingSet::new();
        let mapping = ring_mapping();

        for i in 0..VENUS_MAX_RINGS {
            rings
                .attach(Ring::new(i as u64, mapping.clone(), 0, false).unwrap())
                .unwrap();
        }
        assert!(rings
            .attach(Ring::new(1000, mapping.clone(), 0, false).unwrap())
            .is_err());

        rings.detach(0).unwrap();
        // Re-attach after detach is fine; the same id twice is not.
        rings
            .attach(Ring::new(0, mapping.clone(), 0, false).unwrap())
            .unwrap();
        assert!(rings
            .attach(Ring::new(0, mapping, 0, false).unwrap())
            .is_err());
    }

    #[test]
    fn head_offset_validated() {
        let mapping = ring_mapping();
        assert!(Ring::new(1, mapping.clone(), 2, false).is_err());
        assert!(Ring::new(1, mapping.clone(), 4096, false).is_err());
        assert!(Ring::new(1, mapping, 4092, false).is_ok());
    }

    #[test]
    fn wait_returns_immediately_when_head_already_passed() {
        let rings = RingSet::new();
        let mapping = ring_mapping();
        write_head(&mapping, 0, 1001);
        rings
            .attach(Ring::new(7, mapping, 0, false).unwrap())
            .unwrap();

        assert!(rings.wait_seqno(7, 1000).unwrap());
    }

    #[test]
    fn wait_wakes_on_matching_head_update() {
        let rings = Arc::new(RingSet::new());
        let mapping = ring_mapping();
        rings
            .attach(Ring::new(7, mapping.clone(), 0, false).unwrap())
            .unwrap();

        let waiter_rings = rings.clone();
        let waiter = thread::spawn(move || waiter_rings.wait_seqno(7, 1000).unwrap());

        // An update for another ring must not complete the wait.
        rings.on_head_update(8, 2000);
        thread::sleep(Duration::from_millis(10));
        assert!(!waiter.is_finished());

        write_head(&mapping, 0, 1001);
        rings.on_head_update(7, 1001);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn shutdown_aborts_wait() {
        let rings = Arc::new(RingSet::new());
        let mapping = ring_mapping();
        rings
            .attach(Ring::new(7, mapping, 0, false).unwrap())
            .unwrap();

        let waiter_rings = rings.clone();
        let waiter = thread::spawn(move || waiter_rings.wait_seqno(7, 1000).unwrap());
        thread::sleep(Duration::from_millis(10));

        rings.shutdown();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn monitor_sweeps_until_stopped() {
        let monitor = RingMonitor::new();
        let sweeps = Arc::new(AtomicU32::new(0));
        let sweeps_clone = sweeps.clone();

        monitor
            .init(1000, move || {
                sweeps_clone.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();

        // A second init of a running monitor is rejected.
        assert!(monitor.init(1000, || true).is_err());

        let start = Instant::now();
        while sweeps.load(Ordering::SeqCst) < 3 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
        }

        monitor.stop();
        let after_stop = sweeps.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sweeps.load(Ordering::SeqCst), after_stop);

        // Stopping twice is harmless.
        monitor.stop();
    }
}
