//! Table of kernel-managed semaphores.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;

use super::semaphore::SemaphoreShared;
use crate::wait_queue::{QueueId, WaitQueue};

/// Handle of a user semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemaphoreId(u64);

impl SemaphoreId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SemaphoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sem{}", self.0)
    }
}

/// A semaphore's counter and its kernel wait queue.
#[derive(Debug)]
pub(crate) struct UserSemaphore {
    pub(crate) shared: Arc<SemaphoreShared>,
    pub(crate) waiters: WaitQueue,
}

/// All live semaphores, keyed by handle.
#[derive(Debug)]
pub(crate) struct SemaphoreTable {
    entries: BTreeMap<SemaphoreId, UserSemaphore>,
    next_id: u64,
}

impl SemaphoreTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Creates a semaphore and returns its handle.
    pub(crate) fn create(&mut self, initial: isize) -> SemaphoreId {
        let id = SemaphoreId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            UserSemaphore {
                shared: Arc::new(SemaphoreShared::new(initial)),
                waiters: WaitQueue::new(QueueId::Semaphore(id)),
            },
        );
        id
    }

    pub(crate) fn get(&self, id: SemaphoreId) -> Option<&UserSemaphore> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: SemaphoreId) -> Option<&mut UserSemaphore> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: SemaphoreId) -> Option<UserSemaphore> {
        self.entries.remove(&id)
    }
}
