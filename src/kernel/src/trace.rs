//! Bounded, lossy trace ring.
//!
//! Recording never blocks and never allocates after the first record: when
//! the ring is full the new record is dropped and counted.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use rendezvous_hal::{TraceRecord, TraceSink};
use spin::Once;

use crate::config::TraceMask;

/// Fixed-capacity buffer of [`TraceRecord`]s.
pub struct TraceBuffer {
    ring: Once<ArrayQueue<TraceRecord>>,
    capacity: usize,
    mask: TraceMask,
    dropped: AtomicU64,
}

impl TraceBuffer {
    /// Creates a buffer for `capacity` records of the kinds in `mask`. A
    /// zero capacity disables tracing.
    pub fn new(capacity: usize, mask: TraceMask) -> Self {
        Self {
            ring: Once::new(),
            capacity,
            mask,
            dropped: AtomicU64::new(0),
        }
    }

    fn ring(&self) -> Option<&ArrayQueue<TraceRecord>> {
        if self.capacity == 0 {
            return None;
        }
        Some(self.ring.call_once(|| ArrayQueue::new(self.capacity)))
    }

    /// Removes and returns all buffered records, oldest first.
    pub fn drain(&self) -> Vec<TraceRecord> {
        let Some(ring) = self.ring.get() else {
            return Vec::new();
        };
        core::iter::from_fn(|| ring.pop()).collect()
    }

    /// Records lost because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.ring.get().map_or(0, ArrayQueue::len)
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceSink for TraceBuffer {
    fn record(&self, record: TraceRecord) -> bool {
        if !self.mask.covers(record.kind) {
            return false;
        }
        let Some(ring) = self.ring() else {
            return false;
        };
        if ring.push(record).is_err() {
            let lost = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if lost.is_power_of_two() {
                log::warn!("trace: ring full, {} records dropped so far", lost);
            }
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendezvous_common::ContextRef;
    use rendezvous_hal::TraceKind;

    fn record(kind: TraceKind, timestamp: u64) -> TraceRecord {
        TraceRecord {
            kind,
            actor: ContextRef::new(0, 0),
            partner: None,
            outcome: None,
            timestamp,
        }
    }

    #[test]
    fn test_full_ring_drops_newest() {
        let trace = TraceBuffer::new(2, TraceMask::all());
        assert!(trace.record(record(TraceKind::Block, 1)));
        assert!(trace.record(record(TraceKind::Wakeup, 2)));
        assert!(!trace.record(record(TraceKind::Rendezvous, 3)));
        assert_eq!(trace.dropped(), 1);

        let drained = trace.drain();
        assert_eq!(drained.iter().map(|r| r.timestamp).collect::<Vec<_>>(), vec![1, 2]);
        assert!(trace.is_empty());
    }

    #[test]
    fn test_mask_filters_kinds() {
        let trace = TraceBuffer::new(8, TraceMask::SEMAPHORE);
        assert!(!trace.record(record(TraceKind::Block, 1)));
        assert!(trace.record(record(TraceKind::SemaphoreUp, 2)));
        assert_eq!(trace.len(), 1);
        assert_eq!(trace.dropped(), 0);
    }

    #[test]
    fn test_zero_capacity_disables() {
        let trace = TraceBuffer::new(0, TraceMask::all());
        assert!(!trace.record(record(TraceKind::Block, 1)));
        assert!(trace.drain().is_empty());
    }
}
