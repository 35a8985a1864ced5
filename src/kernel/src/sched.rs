//! A simple banded ready-queue scheduler.
//!
//! Threads are kept in four FIFO bands by priority (`priority >> 6`), and
//! the highest non-empty band runs first. Removal from the ready set is
//! lazy: a blocked thread stays in its band until popped, and is skipped
//! then because it is no longer in `ready`.

use alloc::collections::BTreeSet;

use crossbeam_queue::ArrayQueue;
use rendezvous_common::ContextRef;
use rendezvous_hal::Scheduler;

/// Number of priority bands.
pub const BANDS: usize = 4;

/// Handle reported as current before any thread runs.
pub const IDLE: ContextRef = ContextRef::new(u32::MAX, 0);

/// Band a priority falls into.
pub const fn band_of(priority: u8) -> usize {
    (priority >> 6) as usize
}

/// Priority-banded FIFO scheduler.
pub struct BandScheduler {
    current: ContextRef,
    bands: [ArrayQueue<ContextRef>; BANDS],
    ready: BTreeSet<ContextRef>,
    switches: u64,
}

impl BandScheduler {
    /// Create a scheduler whose bands hold up to `capacity` threads each.
    pub fn new(capacity: usize) -> Self {
        BandScheduler {
            current: IDLE,
            bands: core::array::from_fn(|_| ArrayQueue::new(capacity.max(1))),
            ready: BTreeSet::new(),
            switches: 0,
        }
    }

    /// Makes `thread` the running thread without counting a switch.
    pub fn set_current(&mut self, thread: ContextRef) {
        self.ready.remove(&thread);
        self.current = thread;
    }

    /// Picks the next thread to run and makes it current.
    pub fn pick_next(&mut self) -> Option<ContextRef> {
        // Iterate bands from highest down to lowest
        for band in self.bands.iter().rev() {
            while let Some(thread) = band.pop() {
                if self.ready.remove(&thread) {
                    self.current = thread;
                    self.switches += 1;
                    return Some(thread);
                }
            }
        }
        None
    }

    /// True if `thread` is in the ready set.
    pub fn is_ready(&self, thread: ContextRef) -> bool {
        self.ready.contains(&thread)
    }

    /// Number of ready threads.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Drops stale entries of threads that left the ready set.
    fn compact(&mut self, band: usize) {
        let queue = &self.bands[band];
        let mut seen = BTreeSet::new();
        for _ in 0..queue.len() {
            if let Some(thread) = queue.pop() {
                if self.ready.contains(&thread) && seen.insert(thread) {
                    let _ = queue.push(thread);
                }
            }
        }
    }

    /// Context switches performed so far.
    pub fn switches(&self) -> u64 {
        self.switches
    }
}

impl Default for BandScheduler {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_THREADS)
    }
}

impl Scheduler for BandScheduler {
    fn current(&self) -> ContextRef {
        self.current
    }

    fn enqueue_ready(&mut self, thread: ContextRef, priority: u8) {
        if !self.ready.insert(thread) {
            return;
        }
        let band = band_of(priority);
        if self.bands[band].push(thread).is_err() {
            self.compact(band);
            if self.bands[band].push(thread).is_err() {
                log::error!("scheduler: band {} full, {} not queued", band, thread);
                self.ready.remove(&thread);
            }
        }
    }

    fn switch_to(&mut self, thread: ContextRef) {
        if thread != self.current {
            self.switches += 1;
        }
        self.ready.remove(&thread);
        self.current = thread;
    }

    fn dequeue(&mut self, thread: ContextRef) {
        self.ready.remove(&thread);
    }
}
