//! Arena of thread control blocks.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use rendezvous_common::id::{LTHREAD_BITS, TASK_BITS};
use rendezvous_common::{ContextRef, ThreadId, ThreadIdentifier};

use super::{Tcb, ThreadParams};
use crate::error::KernelError;
use crate::wait_queue::{QueueLink, QueueNodes};

struct Slot {
    generation: u32,
    tcb: Option<Tcb>,
}

/// Fixed-capacity arena of threads, indexed by [`ContextRef`] and by
/// thread identifier.
pub struct ThreadTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Live threads by version-free thread number.
    by_number: BTreeMap<u32, ContextRef>,
    /// Last version handed out per thread number.
    versions: BTreeMap<u32, u32>,
    capacity: usize,
}

impl ThreadTable {
    /// Creates an empty table for up to `capacity` threads.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_number: BTreeMap::new(),
            versions: BTreeMap::new(),
            capacity,
        }
    }

    /// Creates a thread. Its version is one past the version the same
    /// (task, local thread) pair had last time.
    pub fn create(&mut self, params: &ThreadParams) -> Result<ContextRef, KernelError> {
        if params.task >> TASK_BITS != 0 || params.lthread >> LTHREAD_BITS != 0 {
            return Err(KernelError::IdentifierOutOfRange);
        }
        let number = ThreadId::from_parts(params.task, params.lthread, 0).global_thread();
        if self.by_number.contains_key(&number) {
            return Err(KernelError::IdentifierInUse);
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    tcb: None,
                });
                (self.slots.len() - 1) as u32
            }
            None => return Err(KernelError::NoFreeSlot),
        };
        let slot = &mut self.slots[index as usize];
        let handle = ContextRef::new(index, slot.generation);

        let version = ThreadId::next_version(self.versions.get(&number).copied().unwrap_or(0));
        self.versions.insert(number, version);
        let id = ThreadId::from_parts(params.task, params.lthread, version);

        slot.tcb = Some(Tcb::new(id, params, handle));
        self.by_number.insert(number, handle);
        Ok(handle)
    }

    /// Deletes a thread; its handle and identifier become stale.
    pub fn remove(&mut self, handle: ContextRef) -> Option<Tcb> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        let tcb = slot.tcb.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index() as u32);
        self.by_number.remove(&tcb.id.global_thread());
        Some(tcb)
    }

    /// The thread behind a handle, if it is still alive.
    pub fn get(&self, handle: ContextRef) -> Option<&Tcb> {
        let slot = self.slots.get(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.tcb.as_ref()
    }

    /// Mutable access to a live thread.
    pub fn get_mut(&mut self, handle: ContextRef) -> Option<&mut Tcb> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.tcb.as_mut()
    }

    /// Resolves an identifier. Nil, invalid and stale identifiers resolve to
    /// nothing.
    pub fn lookup(&self, id: ThreadId) -> Option<ContextRef> {
        if id.is_nil() || id.is_invalid() {
            return None;
        }
        let handle = *self.by_number.get(&id.global_thread())?;
        match self.get(handle) {
            Some(tcb) if tcb.id == id => Some(handle),
            _ => None,
        }
    }

    /// Handles of all live threads.
    pub fn handles(&self) -> Vec<ContextRef> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Live threads with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (ContextRef, &Tcb)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.tcb
                .as_ref()
                .map(|tcb| (ContextRef::new(index as u32, slot.generation), tcb))
        })
    }

    /// Number of live threads.
    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    /// True if no thread exists.
    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }
}

impl QueueNodes for ThreadTable {
    fn link(&self, thread: ContextRef) -> Option<&QueueLink> {
        self.get(thread).map(|tcb| &tcb.link)
    }

    fn link_mut(&mut self, thread: ContextRef) -> Option<&mut QueueLink> {
        self.get_mut(thread).map(|tcb| &mut tcb.link)
    }

    fn priority(&self, thread: ContextRef) -> u8 {
        self.get(thread).map_or(0, |tcb| tcb.priority)
    }
}
