//! Timeout registry.
//!
//! Every armed timeout is represented by exactly one [`TimeoutHandle`],
//! stored in the owning thread. The handle is neither `Clone` nor `Copy`
//! and is consumed by whichever of [`TimeoutRegistry::disarm`] (rendezvous
//! or cancellation) and [`TimeoutRegistry::retire`] (expiry) runs first, so
//! a registration cannot be removed twice.

use alloc::collections::BTreeMap;

use rendezvous_common::ContextRef;

/// Registry key: deadline first, then arming order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    deadline: u64,
    seq: u64,
}

impl TimerKey {
    /// Clock value at which the timeout fires.
    pub fn deadline(&self) -> u64 {
        self.deadline
    }
}

/// Single owner of one armed timeout.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a dropped handle leaves its registration armed"]
pub struct TimeoutHandle {
    key: TimerKey,
}

impl TimeoutHandle {
    /// Clock value at which the timeout fires.
    pub fn deadline(&self) -> u64 {
        self.key.deadline
    }
}

/// A registration that has fired and was taken out of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    /// Thread the timeout belonged to.
    pub thread: ContextRef,
    /// Key of the fired registration.
    pub key: TimerKey,
}

/// Armed timeouts ordered by deadline.
#[derive(Debug, Default)]
pub struct TimeoutRegistry {
    armed: BTreeMap<TimerKey, ContextRef>,
    next_seq: u64,
}

impl TimeoutRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a timeout for `thread` at `deadline`.
    pub fn arm(&mut self, deadline: u64, thread: ContextRef) -> TimeoutHandle {
        let key = TimerKey {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.armed.insert(key, thread);
        TimeoutHandle { key }
    }

    /// Withdraws a timeout that has not fired. Returns `false` if the
    /// registration was already gone.
    pub fn disarm(&mut self, handle: TimeoutHandle) -> bool {
        self.armed.remove(&handle.key).is_some()
    }

    /// Takes the earliest registration due at `now`.
    pub fn pop_expired(&mut self, now: u64) -> Option<Fired> {
        let (&key, _) = self.armed.first_key_value()?;
        if key.deadline > now {
            return None;
        }
        let thread = self.armed.remove(&key)?;
        Some(Fired { thread, key })
    }

    /// Consumes the handle belonging to a fired registration. Returns
    /// `false` if the handle is not the one that fired; its own
    /// registration is withdrawn in that case.
    pub fn retire(&mut self, handle: TimeoutHandle, fired: &Fired) -> bool {
        if handle.key == fired.key {
            return true;
        }
        self.armed.remove(&handle.key);
        false
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<u64> {
        self.armed.keys().next().map(TimerKey::deadline)
    }

    /// Number of armed timeouts.
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// True if nothing is armed.
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(i: u32) -> ContextRef {
        ContextRef::new(i, 0)
    }

    #[test]
    fn test_expiry_order() {
        let mut reg = TimeoutRegistry::new();
        let _late = reg.arm(30, t(0));
        let _early = reg.arm(10, t(1));
        let _tie = reg.arm(10, t(2));
        assert_eq!(reg.next_deadline(), Some(10));

        assert_eq!(reg.pop_expired(5), None);
        assert_eq!(reg.pop_expired(10).map(|f| f.thread), Some(t(1)));
        assert_eq!(reg.pop_expired(10).map(|f| f.thread), Some(t(2)));
        assert_eq!(reg.pop_expired(29), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_disarm_prevents_fire() {
        let mut reg = TimeoutRegistry::new();
        let handle = reg.arm(10, t(0));
        assert!(reg.disarm(handle));
        assert!(reg.pop_expired(100).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_retire_matches_fired_handle() {
        let mut reg = TimeoutRegistry::new();
        let a = reg.arm(10, t(0));
        let b = reg.arm(20, t(1));
        let fired = reg.pop_expired(10).unwrap();
        assert_eq!(fired.thread, t(0));
        assert!(!reg.retire(b, &fired));
        assert!(reg.retire(a, &fired));
        assert!(reg.is_empty());
    }
}
