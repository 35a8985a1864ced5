//! Priority-ordered wait queues with links embedded in the waiting threads.
//!
//! A queue owns only its head, tail and length. The per-thread
//! [`QueueLink`] records which queue a thread sits in and its neighbours,
//! so a thread can be in at most one queue and removal needs no search.
//! Link storage is reached through [`QueueNodes`], implemented by the
//! thread table.
//!
//! Ordering: higher priority first, arrival order within a priority.

use alloc::vec::Vec;

use rendezvous_common::ContextRef;

use crate::error::{invariant_violation, KernelError};
use crate::sync::SemaphoreId;

/// Names a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// Senders blocked on the given receiver.
    Senders(ContextRef),
    /// Threads blocked in `down` on a semaphore.
    Semaphore(SemaphoreId),
}

/// Queue membership of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueLink {
    queue: Option<QueueId>,
    prev: Option<ContextRef>,
    next: Option<ContextRef>,
}

impl QueueLink {
    /// The queue this thread is in, if any.
    pub fn queue(&self) -> Option<QueueId> {
        self.queue
    }
}

/// Storage of queue links, indexed by thread handle.
pub trait QueueNodes {
    /// Link of a live thread.
    fn link(&self, thread: ContextRef) -> Option<&QueueLink>;
    /// Mutable link of a live thread.
    fn link_mut(&mut self, thread: ContextRef) -> Option<&mut QueueLink>;
    /// Current scheduling priority of a live thread.
    fn priority(&self, thread: ContextRef) -> u8;
}

/// An ordered queue of blocked threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitQueue {
    id: QueueId,
    head: Option<ContextRef>,
    tail: Option<ContextRef>,
    len: usize,
}

impl WaitQueue {
    /// Creates an empty queue.
    pub const fn new(id: QueueId) -> Self {
        Self {
            id,
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Identity of this queue.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Number of queued threads.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no thread is queued.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// The thread that would be released next.
    pub fn first(&self) -> Option<ContextRef> {
        self.head
    }

    /// True if `thread` is queued here.
    pub fn contains<N: QueueNodes>(&self, nodes: &N, thread: ContextRef) -> bool {
        nodes
            .link(thread)
            .is_some_and(|link| link.queue == Some(self.id))
    }

    /// Inserts `thread` behind every waiter of equal or higher priority.
    pub fn enqueue<N: QueueNodes>(
        &mut self,
        nodes: &mut N,
        thread: ContextRef,
    ) -> Result<(), KernelError> {
        match nodes.link(thread) {
            None => return Err(KernelError::StaleHandle),
            Some(link) if link.queue.is_some() => {
                return Err(invariant_violation!(
                    "thread {} enqueued on {:?} while in {:?}",
                    thread,
                    self.id,
                    link.queue
                ));
            }
            Some(_) => {}
        }

        let priority = nodes.priority(thread);
        let mut before = self.head;
        while let Some(node) = before {
            if nodes.priority(node) < priority {
                break;
            }
            before = nodes.link(node).and_then(|link| link.next);
        }
        let prev = match before {
            Some(node) => nodes.link(node).and_then(|link| link.prev),
            None => self.tail,
        };

        if let Some(link) = nodes.link_mut(thread) {
            *link = QueueLink {
                queue: Some(self.id),
                prev,
                next: before,
            };
        }
        match prev {
            Some(node) => self.set_next(nodes, node, Some(thread))?,
            None => self.head = Some(thread),
        }
        match before {
            Some(node) => self.set_prev(nodes, node, Some(thread))?,
            None => self.tail = Some(thread),
        }
        self.len += 1;
        log::trace!("wait queue {:?}: enqueued {} (prio {})", self.id, thread, priority);
        Ok(())
    }

    /// Removes and returns the first thread.
    pub fn dequeue<N: QueueNodes>(&mut self, nodes: &mut N) -> Option<ContextRef> {
        let head = self.head?;
        match self.remove(nodes, head) {
            Ok(true) => Some(head),
            _ => None,
        }
    }

    /// Unlinks `thread`. Returns `Ok(false)` if it is not in this queue.
    pub fn remove<N: QueueNodes>(
        &mut self,
        nodes: &mut N,
        thread: ContextRef,
    ) -> Result<bool, KernelError> {
        let link = match nodes.link(thread) {
            Some(link) if link.queue == Some(self.id) => *link,
            Some(_) => return Ok(false),
            None => return Err(KernelError::StaleHandle),
        };
        match link.prev {
            Some(prev) => self.set_next(nodes, prev, link.next)?,
            None => {
                if self.head != Some(thread) {
                    return Err(invariant_violation!(
                        "{} has no predecessor but is not head of {:?}",
                        thread,
                        self.id
                    ));
                }
                self.head = link.next;
            }
        }
        match link.next {
            Some(next) => self.set_prev(nodes, next, link.prev)?,
            None => {
                if self.tail != Some(thread) {
                    return Err(invariant_violation!(
                        "{} has no successor but is not tail of {:?}",
                        thread,
                        self.id
                    ));
                }
                self.tail = link.prev;
            }
        }
        if let Some(link) = nodes.link_mut(thread) {
            *link = QueueLink::default();
        }
        self.len -= 1;
        Ok(true)
    }

    /// Moves `thread` to the position its current priority calls for.
    pub fn reposition<N: QueueNodes>(
        &mut self,
        nodes: &mut N,
        thread: ContextRef,
    ) -> Result<(), KernelError> {
        if self.remove(nodes, thread)? {
            self.enqueue(nodes, thread)?;
        }
        Ok(())
    }

    /// Queued threads in release order.
    pub fn to_vec<N: QueueNodes>(&self, nodes: &N) -> Vec<ContextRef> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(node) = cursor {
            out.push(node);
            cursor = nodes.link(node).and_then(|link| link.next);
        }
        out
    }

    fn set_next<N: QueueNodes>(
        &self,
        nodes: &mut N,
        node: ContextRef,
        next: Option<ContextRef>,
    ) -> Result<(), KernelError> {
        match nodes.link_mut(node) {
            Some(link) if link.queue == Some(self.id) => {
                link.next = next;
                Ok(())
            }
            _ => Err(invariant_violation!("stale link at {} in {:?}", node, self.id)),
        }
    }

    fn set_prev<N: QueueNodes>(
        &self,
        nodes: &mut N,
        node: ContextRef,
        prev: Option<ContextRef>,
    ) -> Result<(), KernelError> {
        match nodes.link_mut(node) {
            Some(link) if link.queue == Some(self.id) => {
                link.prev = prev;
                Ok(())
            }
            _ => Err(invariant_violation!("stale link at {} in {:?}", node, self.id)),
        }
    }
}
