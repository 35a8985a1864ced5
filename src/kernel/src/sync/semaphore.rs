//! Counting semaphore with a user-level fast path.
//!
//! The counter lives in [`SemaphoreShared`], which user code can operate
//! on directly: `try_down` succeeds while units are available and `try_up`
//! while nobody waits. Only contention reaches the kernel, where `down`
//! blocks the caller in the semaphore's wait queue and `up` releases the
//! first waiter.
//!
//! A negative counter is the number of blocked waiters. A waiter that
//! leaves without being released (timeout, cancel, deletion) gives its
//! unit back, so the counter stays consistent with the queue.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

use rendezvous_common::{AbsoluteFlags, ContextRef, Deadline, Timeout};
use rendezvous_hal::{Platform, TraceKind};

use super::registry::SemaphoreId;
use crate::error::KernelError;
use crate::thread::{Completion, Source, ThreadState};
use crate::wait_queue::QueueId;
use crate::Kernel;

/// Counter state shared between user space and the kernel.
#[derive(Debug)]
pub struct SemaphoreShared {
    counter: AtomicIsize,
    /// Set while a waiter is, or is about to be, queued in the kernel.
    queued: AtomicBool,
}

impl SemaphoreShared {
    pub fn new(initial: isize) -> Self {
        Self {
            counter: AtomicIsize::new(initial),
            queued: AtomicBool::new(false),
        }
    }

    /// Current counter value.
    pub fn count(&self) -> isize {
        self.counter.load(Ordering::Acquire)
    }

    /// True while waiters may be queued in the kernel.
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// Takes a unit without entering the kernel. Returns `false` if none is
    /// available.
    pub fn try_down(&self) -> bool {
        loop {
            let current = self.counter.load(Ordering::Relaxed);
            if current <= 0 {
                return false;
            }
            if self
                .counter
                .compare_exchange_weak(current, current - 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Returns a unit without entering the kernel. Returns `false` if a
    /// waiter has to be woken, which only the kernel can do.
    pub fn try_up(&self) -> bool {
        loop {
            let current = self.counter.load(Ordering::Relaxed);
            if current < 0 || self.queued.load(Ordering::Acquire) {
                return false;
            }
            if self
                .counter
                .compare_exchange_weak(current, current + 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// How a `down` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemOutcome {
    /// A unit was taken.
    Ok,
    /// The timeout expired first.
    Timeout,
    /// The waiter was cancelled.
    Cancelled,
    /// The semaphore was destroyed.
    Invalid,
}

/// Immediate result of a semaphore system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemStatus {
    Done(SemOutcome),
    /// The caller blocked; the outcome arrives as a completion.
    Blocked,
}

impl<P: Platform> Kernel<P> {
    /// Creates a semaphore holding `initial` units.
    pub fn semaphore_create(&mut self, initial: isize) -> SemaphoreId {
        let id = self.semaphores.create(initial);
        log::debug!("semaphore {} created with {} units", id, initial);
        id
    }

    /// The user-visible counter of a semaphore.
    pub fn semaphore_shared(&self, id: SemaphoreId) -> Option<Arc<SemaphoreShared>> {
        self.semaphores.get(id).map(|entry| entry.shared.clone())
    }

    /// Takes a unit, blocking the current thread until one is available
    /// or the receive part of `timeout` expires.
    pub fn semaphore_down(
        &mut self,
        id: SemaphoreId,
        timeout: Timeout,
    ) -> Result<SemStatus, KernelError> {
        let current = self.current()?;
        let now = self.now();
        let entry = self.semaphores.get(id).ok_or(KernelError::UnknownSemaphore)?;
        let shared = entry.shared.clone();

        shared.queued.store(true, Ordering::Release);
        let previous = shared.counter.fetch_sub(1, Ordering::AcqRel);
        if previous > 0 {
            self.semaphore_settle_flag(id);
            self.emit(TraceKind::SemaphoreDown, current, None, None);
            return Ok(SemStatus::Done(SemOutcome::Ok));
        }

        let deadline = timeout.receive_deadline(now, AbsoluteFlags::empty());
        if deadline == Deadline::Expired {
            shared.counter.fetch_add(1, Ordering::AcqRel);
            self.semaphore_settle_flag(id);
            return Ok(SemStatus::Done(SemOutcome::Timeout));
        }

        self.with_queue(QueueId::Semaphore(id), |queue, threads| queue.enqueue(threads, current))
            .ok_or(KernelError::UnknownSemaphore)??;
        self.block(
            current,
            ThreadState::ReceiveBlocked {
                source: Source::Semaphore(id),
            },
            deadline,
        );
        self.emit(TraceKind::SemaphoreDown, current, None, None);
        self.settle(Some(current), false);
        Ok(SemStatus::Blocked)
    }

    /// Returns a unit, releasing the first waiter if there is one.
    pub fn semaphore_up(&mut self, id: SemaphoreId) -> Result<SemStatus, KernelError> {
        let current = self.current().ok();
        let entry = self.semaphores.get(id).ok_or(KernelError::UnknownSemaphore)?;
        let previous = entry.shared.counter.fetch_add(1, Ordering::AcqRel);
        if previous < 0 {
            let woken = self
                .with_queue(QueueId::Semaphore(id), |queue, threads| queue.dequeue(threads))
                .flatten();
            match woken {
                Some(waiter) => self.release(waiter, Completion::Semaphore(SemOutcome::Ok)),
                None => log::warn!("semaphore {}: counter was {} but nobody waits", id, previous),
            }
        }
        self.semaphore_settle_flag(id);
        if let Some(current) = current {
            self.emit(TraceKind::SemaphoreUp, current, None, None);
        }
        self.settle(current, true);
        Ok(SemStatus::Done(SemOutcome::Ok))
    }

    /// Destroys a semaphore. Its waiters are released with
    /// [`SemOutcome::Invalid`]. Returns how many there were.
    pub fn semaphore_destroy(&mut self, id: SemaphoreId) -> Result<usize, KernelError> {
        let mut entry = self.semaphores.remove(id).ok_or(KernelError::UnknownSemaphore)?;
        let mut evicted = 0;
        while let Some(waiter) = entry.waiters.dequeue(&mut self.threads) {
            self.release(waiter, Completion::Semaphore(SemOutcome::Invalid));
            evicted += 1;
        }
        log::debug!("semaphore {} destroyed, {} waiters evicted", id, evicted);
        let current = self.current().ok();
        self.settle(current, true);
        Ok(evicted)
    }

    /// Ends a wait that was not satisfied by an `up`.
    pub(crate) fn semaphore_abandon(
        &mut self,
        id: SemaphoreId,
        waiter: ContextRef,
        outcome: SemOutcome,
    ) {
        self.semaphore_refund(id);
        self.release(waiter, Completion::Semaphore(outcome));
        self.semaphore_settle_flag(id);
    }

    /// Gives back the unit a departing waiter had taken.
    pub(crate) fn semaphore_refund(&mut self, id: SemaphoreId) {
        if let Some(entry) = self.semaphores.get(id) {
            entry.shared.counter.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Clears the `queued` flag once no waiter is left.
    pub(crate) fn semaphore_settle_flag(&mut self, id: SemaphoreId) {
        if let Some(entry) = self.semaphores.get(id) {
            if entry.waiters.is_empty() {
                entry.shared.queued.store(false, Ordering::Release);
            }
        }
    }
}
