// Three-phase strict-order ring. Slots carry a one-byte state marker; the
// payload lives in user memory indexed by slot number. Four cursors chase
// each other around the ring: pop_fixed -> proc_fixed -> proc_run ->
// push_fixed -> (wrap) pop_fixed, with one slot kept free so a full ring
// and an empty ring stay distinguishable.
use crate::SoqueHandler;
use std::alloc::Layout;
use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

pub(crate) const MARKER_EMPTY: u8 = 0;
pub(crate) const MARKER_FILLED: u8 = 1;
pub(crate) const MARKER_PROCESSED: u8 = 2;

#[repr(C, align(64))]
pub struct Soque {
    // Ingress cursor: next slot the producer fills. Written only under the
    // push/pop gate.
    push_fixed: AtomicUsize,
    _pad0: [u8; 64 - std::mem::size_of::<AtomicUsize>()],

    // Claim cursor: next slot not yet handed to a processor. Advanced by CAS
    // from any worker.
    proc_run: AtomicUsize,
    _pad1: [u8; 64 - std::mem::size_of::<AtomicUsize>()],

    // Retire boundary: end of the contiguous prefix of completed work.
    proc_fixed: AtomicUsize,
    _pad2: [u8; 64 - std::mem::size_of::<AtomicUsize>()],

    // Egress cursor: next slot the consumer frees. Written only under the
    // push/pop gate.
    pop_fixed: AtomicUsize,
    _pad3: [u8; 64 - std::mem::size_of::<AtomicUsize>()],

    // Serialises the retire-boundary scan.
    proc_lock: AtomicBool,
    _pad4: [u8; 64 - std::mem::size_of::<AtomicBool>()],

    // Push/pop gate: at most one thread owns ingress and egress at a time.
    pp_lock: AtomicBool,
    _pad5: [u8; 64 - std::mem::size_of::<AtomicBool>()],

    // Read-only after open.
    q_size: usize,
    handler: Arc<dyn SoqueHandler>,
    markers: *mut AtomicU8,
}

unsafe impl Send for Soque {}
unsafe impl Sync for Soque {}

fn marker_layout(size: usize) -> Layout {
    Layout::array::<AtomicU8>(size)
        .unwrap()
        .align_to(64)
        .unwrap()
}

impl Soque {
    /// Build a queue of `size` slots. One slot stays reserved, so the usable
    /// capacity is `size - 1`; a size below 2 is rejected.
    pub fn with_capacity(size: usize, handler: Arc<dyn SoqueHandler>) -> Self {
        assert!(size >= 2, "ring needs one data slot plus the reserved slot");

        let layout = marker_layout(size);
        // Zeroed bytes are EMPTY markers.
        let markers = unsafe { std::alloc::alloc_zeroed(layout) as *mut AtomicU8 };
        if markers.is_null() {
            panic!("failed to allocate marker buffer");
        }

        Self {
            push_fixed: AtomicUsize::new(0),
            _pad0: [0u8; 64 - std::mem::size_of::<AtomicUsize>()],
            proc_run: AtomicUsize::new(0),
            _pad1: [0u8; 64 - std::mem::size_of::<AtomicUsize>()],
            proc_fixed: AtomicUsize::new(0),
            _pad2: [0u8; 64 - std::mem::size_of::<AtomicUsize>()],
            pop_fixed: AtomicUsize::new(0),
            _pad3: [0u8; 64 - std::mem::size_of::<AtomicUsize>()],
            proc_lock: AtomicBool::new(false),
            _pad4: [0u8; 64 - std::mem::size_of::<AtomicBool>()],
            pp_lock: AtomicBool::new(false),
            _pad5: [0u8; 64 - std::mem::size_of::<AtomicBool>()],
            q_size: size,
            handler,
            markers,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.q_size
    }

    #[inline]
    pub fn handler(&self) -> &dyn SoqueHandler {
        &*self.handler
    }

    #[inline]
    fn marker(&self, index: usize) -> &AtomicU8 {
        debug_assert!(index < self.q_size);
        unsafe { &*self.markers.add(index) }
    }

    #[inline]
    fn wrap(&self, index: usize) -> usize {
        if index >= self.q_size {
            index - self.q_size
        } else {
            index
        }
    }

    // Ring distance from `from` forward to `to`.
    #[inline]
    fn distance(&self, from: usize, to: usize) -> usize {
        if to >= from {
            to - from
        } else {
            to + self.q_size - from
        }
    }

    /// Try to take the push/pop gate.
    #[inline]
    pub fn pp_enter(&self) -> bool {
        self.pp_lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the push/pop gate.
    #[inline]
    pub fn pp_leave(&self) {
        self.pp_lock.store(false, Ordering::Release);
    }

    /// Extend the FILLED region by up to `count` slots and return how many
    /// were taken. `count == 0` probes the free capacity without advancing.
    /// Gate holder only.
    pub fn push(&self, count: usize) -> usize {
        let push_here = self.push_fixed.load(Ordering::Relaxed);
        let pop_fixed = self.pop_fixed.load(Ordering::Acquire);
        // The slot before pop_fixed stays reserved.
        let limit = self.wrap(pop_fixed + self.q_size - 1);
        let push_max = self.distance(push_here, limit);

        if count == 0 {
            return push_max;
        }
        if push_max == 0 {
            return 0;
        }

        let count = count.min(push_max);
        let mut index = push_here;
        for _ in 0..count {
            debug_assert_eq!(self.marker(index).load(Ordering::Relaxed), MARKER_EMPTY);
            self.marker(index).store(MARKER_FILLED, Ordering::Relaxed);
            index = self.wrap(index + 1);
        }
        // Markers before cursor: the release store publishes them.
        self.push_fixed.store(index, Ordering::Release);

        count
    }

    /// Claim up to `count` filled slots for processing. Returns the claimed
    /// `(index, count)`; a zero count means nothing was claimable.
    /// `count == 0` probes the claimable window without advancing. Safe from
    /// any thread.
    pub fn proc_get(&self, count: usize) -> (usize, usize) {
        loop {
            let proc_here = self.proc_run.load(Ordering::Acquire);
            let push_fixed = self.push_fixed.load(Ordering::Acquire);
            let proc_max = self.distance(proc_here, push_fixed);

            if count == 0 {
                return (proc_here, proc_max);
            }
            if proc_max == 0 {
                return (proc_here, 0);
            }

            let count = count.min(proc_max);
            let next = self.wrap(proc_here + count);
            // The CAS is the linearisation point of claim assignment.
            if self
                .proc_run
                .compare_exchange_weak(proc_here, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let mut slot = proc_here;
                for _ in 0..count {
                    debug_assert_eq!(self.marker(slot).load(Ordering::Relaxed), MARKER_FILLED);
                    slot = self.wrap(slot + 1);
                }
                return (proc_here, count);
            }
        }
    }

    /// Mark a previously claimed batch complete. If the batch sits at the
    /// retire boundary this call also publishes the new boundary; otherwise
    /// retirement is deferred to the next scan.
    pub fn proc_done(&self, index: usize, count: usize) {
        debug_assert!(index < self.q_size);

        let mut slot = index;
        for _ in 0..count {
            debug_assert_eq!(self.marker(slot).load(Ordering::Relaxed), MARKER_FILLED);
            // Release: the scan's acquire load must see the processor's
            // payload writes.
            self.marker(slot).store(MARKER_PROCESSED, Ordering::Release);
            slot = self.wrap(slot + 1);
        }

        if self.proc_fixed.load(Ordering::Acquire) == index {
            // This claim carries the retire boundary: spin hard, the whole
            // pipeline is waiting on this publish.
            self.lock_retire(false);
            self.advance_retire();
            self.unlock_retire();
        }
    }

    /// Retire up to `count` completed slots back to EMPTY and return how
    /// many were freed. Advances the retire boundary first. `count == 0`
    /// probes the ready window without freeing. Gate holder only.
    pub fn pop(&self, count: usize) -> usize {
        self.lock_retire(true);
        self.advance_retire();
        self.unlock_retire();

        let pop_here = self.pop_fixed.load(Ordering::Relaxed);
        let proc_fixed = self.proc_fixed.load(Ordering::Acquire);
        let pop_max = self.distance(pop_here, proc_fixed);

        if count == 0 {
            return pop_max;
        }
        if pop_max == 0 {
            return 0;
        }

        let count = count.min(pop_max);
        let mut index = pop_here;
        for _ in 0..count {
            debug_assert_eq!(self.marker(index).load(Ordering::Relaxed), MARKER_PROCESSED);
            self.marker(index).store(MARKER_EMPTY, Ordering::Relaxed);
            index = self.wrap(index + 1);
        }
        self.pop_fixed.store(index, Ordering::Release);

        count
    }

    fn lock_retire(&self, yield_on_contention: bool) {
        while self
            .proc_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if yield_on_contention {
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
    }

    fn unlock_retire(&self) {
        self.proc_lock.store(false, Ordering::Release);
    }

    // Walk the contiguous PROCESSED prefix from proc_fixed towards proc_run.
    // Caller holds proc_lock.
    fn advance_retire(&self) {
        let mut next = self.proc_fixed.load(Ordering::Relaxed);
        loop {
            if next == self.proc_run.load(Ordering::Acquire) {
                break;
            }
            if self.marker(next).load(Ordering::Acquire) != MARKER_PROCESSED {
                break;
            }
            next = self.wrap(next + 1);
        }
        self.proc_fixed.store(next, Ordering::Release);
    }
}

impl Drop for Soque {
    fn drop(&mut self) {
        unsafe {
            std::alloc::dealloc(self.markers as *mut u8, marker_layout(self.q_size));
        }
    }
}

impl fmt::Debug for Soque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Soque")
            .field("q_size", &self.q_size)
            .field("push_fixed", &self.push_fixed.load(Ordering::Relaxed))
            .field("proc_run", &self.proc_run.load(Ordering::Relaxed))
            .field("proc_fixed", &self.proc_fixed.load(Ordering::Relaxed))
            .field("pop_fixed", &self.pop_fixed.load(Ordering::Relaxed))
            .field("proc_lock", &self.proc_lock.load(Ordering::Relaxed))
            .field("pp_lock", &self.pp_lock.load(Ordering::Relaxed))
            .finish()
    }
}
