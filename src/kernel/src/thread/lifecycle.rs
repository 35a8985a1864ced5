//! Thread block/wakeup state machine.
//!
//! Threads leave a blocked state in exactly four ways: a partner completes
//! their operation, their timeout fires, somebody cancels them, or their
//! partner is deleted. Each path goes through [`Kernel::release`], which
//! unlinks the thread from its queue, consumes its timeout handle and
//! leaves it `Ready` with a completion. Released threads are collected and
//! handed to the scheduler in [`Kernel::settle`] once the operation is over.

use alloc::vec::Vec;

use rendezvous_common::{ContextRef, Deadline, IpcError, ThreadId};
use rendezvous_hal::{Handoff, Platform, TraceKind};

use super::{Completion, Source, ThreadParams, ThreadState, UserRegisters};
use crate::error::{invariant_violation, KernelError};
use crate::ipc::message::{IpcOutcome, IpcStatus};
use crate::sync::SemOutcome;
use crate::wait_queue::QueueId;
use crate::Kernel;

impl<P: Platform> Kernel<P> {
    /// Creates a ready thread.
    pub fn create_thread(&mut self, params: ThreadParams) -> Result<ContextRef, KernelError> {
        let handle = self.threads.create(&params)?;
        log::debug!(
            "thread {} created as {} in {} (prio {})",
            self.thread_id(handle).unwrap_or_default(),
            handle,
            params.space,
            params.priority
        );
        self.platform.enqueue_ready(handle, params.priority);
        self.emit(TraceKind::ThreadCreate, handle, None, None);
        Ok(handle)
    }

    /// Deletes a thread.
    ///
    /// Whatever the thread was blocked in is withdrawn silently. Senders
    /// queued on it are released with `SendAborted`, receivers waiting for
    /// it specifically with `ReceiveAborted`, as is a receiver its
    /// interrupted local IPC had already claimed.
    pub fn delete_thread(&mut self, id: ThreadId) -> Result<(), KernelError> {
        let handle = self.threads.lookup(id).ok_or(KernelError::UnknownThread)?;
        self.withdraw(handle);

        while let Some(sender) = self
            .with_queue(QueueId::Senders(handle), |queue, threads| queue.dequeue(threads))
            .flatten()
        {
            self.emit(TraceKind::Abort, sender, Some(handle), Some(IpcError::SendAborted));
            self.release(sender, Completion::Ipc(IpcOutcome::failed(IpcError::SendAborted)));
        }

        let waiting: Vec<ContextRef> = self
            .threads
            .iter()
            .filter(|(_, tcb)| {
                tcb.state
                    == ThreadState::ReceiveBlocked {
                        source: Source::Thread(handle),
                    }
            })
            .map(|(waiter, _)| waiter)
            .collect();
        for waiter in waiting {
            self.emit(TraceKind::Abort, waiter, Some(handle), Some(IpcError::ReceiveAborted));
            self.release(waiter, Completion::Ipc(IpcOutcome::failed(IpcError::ReceiveAborted)));
        }

        // A receiver claimed by an interrupted local IPC of this thread. A
        // partner holding its own frame finishes through its resume.
        let claimed: Vec<ContextRef> = self
            .threads
            .iter()
            .filter(|(_, tcb)| {
                tcb.state == ThreadState::InTransfer { partner: handle } && tcb.lipc_frame.is_none()
            })
            .map(|(partner, _)| partner)
            .collect();
        for partner in claimed {
            log::debug!("{} loses its partner {} mid-transfer", partner, handle);
            self.emit(TraceKind::Abort, partner, Some(handle), Some(IpcError::ReceiveAborted));
            self.release(partner, Completion::Ipc(IpcOutcome::failed(IpcError::ReceiveAborted)));
        }

        self.platform.dequeue(handle);
        self.threads.remove(handle);
        self.emit(TraceKind::ThreadDelete, handle, None, None);
        log::debug!("thread {} deleted", id);

        let current = self.current().ok();
        self.settle(current, current.is_some());
        Ok(())
    }

    /// Cancels whatever blocking operation the thread is in. Returns
    /// `false` if it was not blocked.
    pub fn cancel(&mut self, id: ThreadId) -> Result<bool, KernelError> {
        let handle = self.threads.lookup(id).ok_or(KernelError::UnknownThread)?;
        let state = self.threads.get(handle).map(|tcb| tcb.state);
        let cancelled = match state {
            Some(ThreadState::SendBlocked { .. }) => {
                self.release(handle, Completion::Ipc(IpcOutcome::failed(IpcError::SendCancelled)));
                true
            }
            Some(ThreadState::ReceiveBlocked {
                source: Source::Semaphore(sem),
            }) => {
                self.semaphore_abandon(sem, handle, SemOutcome::Cancelled);
                true
            }
            Some(ThreadState::ReceiveBlocked { .. }) | Some(ThreadState::PeriodicWait) => {
                self.release(
                    handle,
                    Completion::Ipc(IpcOutcome::failed(IpcError::ReceiveCancelled)),
                );
                true
            }
            _ => false,
        };
        if cancelled {
            log::debug!("thread {} cancelled", id);
            self.emit(TraceKind::Cancel, handle, None, None);
            let current = self.current().ok();
            self.settle(current, true);
        }
        Ok(cancelled)
    }

    /// Replaces a thread's instruction and/or stack pointer, forcing it out
    /// of any blocked operation first. Returns the previous values.
    pub fn exchange_registers(
        &mut self,
        id: ThreadId,
        ip: Option<u64>,
        sp: Option<u64>,
    ) -> Result<UserRegisters, KernelError> {
        self.cancel(id)?;
        let handle = self.threads.lookup(id).ok_or(KernelError::UnknownThread)?;
        let tcb = self.threads.get_mut(handle).ok_or(KernelError::StaleHandle)?;
        let old = tcb.user;
        if let Some(ip) = ip {
            tcb.user.ip = ip;
        }
        if let Some(sp) = sp {
            tcb.user.sp = sp;
        }
        tcb.lipc_ready = false;
        Ok(old)
    }

    /// Changes a thread's priority, reordering the queue it waits in.
    pub fn set_priority(&mut self, id: ThreadId, priority: u8) -> Result<(), KernelError> {
        let handle = self.threads.lookup(id).ok_or(KernelError::UnknownThread)?;
        let tcb = self.threads.get_mut(handle).ok_or(KernelError::StaleHandle)?;
        tcb.priority = priority;
        if let Some(queue) = tcb.link.queue() {
            self.with_queue(queue, |queue, threads| queue.reposition(threads, handle))
                .unwrap_or(Ok(()))?;
        }
        Ok(())
    }

    /// Blocks the current thread until the clock reaches `at`.
    pub fn wait_next_period(&mut self, at: u64) -> Result<IpcStatus, KernelError> {
        let current = self.current()?;
        if at <= self.now() {
            return Ok(IpcStatus::Done(IpcOutcome::sent()));
        }
        self.block(current, ThreadState::PeriodicWait, Deadline::At(at));
        self.settle(Some(current), false);
        Ok(IpcStatus::Blocked)
    }

    /// Fires every timeout that is due. Returns how many fired.
    pub fn tick(&mut self) -> usize {
        let now = self.now();
        let mut fired = 0;
        while let Some(expired) = self.timeouts.pop_expired(now) {
            fired += 1;
            let handle = expired.thread;
            let Some(tcb) = self.threads.get_mut(handle) else {
                let _ = invariant_violation!("timeout fired for dead thread {}", handle);
                continue;
            };
            let matched = match tcb.timeout.take() {
                Some(own) => self.timeouts.retire(own, &expired),
                None => false,
            };
            if !matched {
                let _ = invariant_violation!("timeout of {} fired without its handle", handle);
                continue;
            }
            let state = tcb.state;
            log::debug!("timeout: {} in {:?}", handle, state);
            match state {
                ThreadState::SendBlocked { partner } => {
                    self.emit(
                        TraceKind::Timeout,
                        handle,
                        Some(partner),
                        Some(IpcError::SendTimeout),
                    );
                    self.release(
                        handle,
                        Completion::Ipc(IpcOutcome::failed(IpcError::SendTimeout)),
                    );
                }
                ThreadState::ReceiveBlocked {
                    source: Source::Semaphore(sem),
                } => {
                    self.emit(TraceKind::Timeout, handle, None, None);
                    self.semaphore_abandon(sem, handle, SemOutcome::Timeout);
                }
                ThreadState::ReceiveBlocked { .. } => {
                    self.emit(TraceKind::Timeout, handle, None, Some(IpcError::ReceiveTimeout));
                    self.release(
                        handle,
                        Completion::Ipc(IpcOutcome::failed(IpcError::ReceiveTimeout)),
                    );
                }
                ThreadState::PeriodicWait => {
                    self.emit(TraceKind::Timeout, handle, None, None);
                    self.release(handle, Completion::Ipc(IpcOutcome::sent()));
                }
                other => {
                    let _ = invariant_violation!("timeout armed for {} in {:?}", handle, other);
                }
            }
        }
        let current = self.current().ok();
        self.settle(current, true);
        fired
    }

    /// Puts `handle` into a blocked state, arming a timeout if one applies.
    pub(crate) fn block(&mut self, handle: ContextRef, state: ThreadState, deadline: Deadline) {
        debug_assert!(state.is_blocked());
        debug_assert!(deadline != Deadline::Expired, "expired deadlines never block");
        let Some(tcb) = self.threads.get_mut(handle) else {
            return;
        };
        tcb.state = state;
        tcb.lipc_ready = matches!(
            state,
            ThreadState::ReceiveBlocked {
                source: Source::Any | Source::Thread(_)
            }
        );
        if let Some(stale) = tcb.timeout.take() {
            let _ = invariant_violation!("{} blocks with a timeout still armed", handle);
            self.timeouts.disarm(stale);
        }
        if let Deadline::At(at) = deadline {
            let armed = self.timeouts.arm(at, handle);
            if let Some(tcb) = self.threads.get_mut(handle) {
                tcb.timeout = Some(armed);
            }
        }
        log::trace!("{} blocks: {:?}, deadline {:?}", handle, state, deadline);
        self.platform.dequeue(handle);
        self.emit(TraceKind::Block, handle, None, None);
    }

    /// Ends `handle`'s blocking operation with `completion`.
    pub(crate) fn release(&mut self, handle: ContextRef, completion: Completion) {
        let Some(queue) = self.threads.get(handle).map(|tcb| tcb.link.queue()) else {
            return;
        };
        if let Some(queue) = queue {
            let _ = self.with_queue(queue, |queue, threads| queue.remove(threads, handle));
        }
        let Some(tcb) = self.threads.get_mut(handle) else {
            return;
        };
        if let Some(armed) = tcb.timeout.take() {
            self.timeouts.disarm(armed);
        }
        let Some(tcb) = self.threads.get_mut(handle) else {
            return;
        };
        tcb.state = ThreadState::Ready;
        tcb.op = None;
        tcb.lipc_ready = false;
        tcb.completion = Some(completion);
        let outcome = match completion {
            Completion::Ipc(outcome) => outcome.error(),
            Completion::Semaphore(_) => None,
        };
        log::trace!("{} released: {:?}", handle, completion);
        self.woken.push(handle);
        self.emit(TraceKind::Wakeup, handle, None, outcome);
    }

    /// Takes `handle` out of whatever it is blocked in without completing
    /// it, giving back any semaphore unit it had taken.
    pub(crate) fn withdraw(&mut self, handle: ContextRef) {
        let Some(tcb) = self.threads.get(handle) else {
            return;
        };
        let (state, queue) = (tcb.state, tcb.link.queue());
        let semaphore = match state {
            ThreadState::ReceiveBlocked {
                source: Source::Semaphore(sem),
            } => Some(sem),
            _ => None,
        };
        if let Some(sem) = semaphore {
            self.semaphore_refund(sem);
        }
        if let Some(queue) = queue {
            let _ = self.with_queue(queue, |queue, threads| queue.remove(threads, handle));
        }
        if let Some(sem) = semaphore {
            self.semaphore_settle_flag(sem);
        }
        if let Some(tcb) = self.threads.get_mut(handle) {
            if let Some(armed) = tcb.timeout.take() {
                self.timeouts.disarm(armed);
            }
        }
        if let Some(tcb) = self.threads.get_mut(handle) {
            tcb.state = ThreadState::Ready;
            tcb.op = None;
            tcb.lipc_ready = false;
        }
    }

    /// Hands the threads released by the finished operation to the
    /// scheduler. At most one of them gets the CPU directly.
    pub(crate) fn settle(&mut self, releaser: Option<ContextRef>, releaser_continues: bool) {
        let woken = core::mem::take(&mut self.woken);
        let mut switched = false;
        for handle in woken {
            let Some(tcb) = self.threads.get(handle) else {
                continue;
            };
            if tcb.state != ThreadState::Ready {
                continue;
            }
            let priority = tcb.priority;
            match self.platform.handoff(handle, releaser_continues) {
                Handoff::SwitchTo if !switched => {
                    if releaser_continues {
                        if let Some(releaser) = releaser.filter(|r| *r != handle) {
                            let priority = self.threads.get(releaser).map_or(0, |tcb| tcb.priority);
                            self.platform.enqueue_ready(releaser, priority);
                        }
                    }
                    self.platform.switch_to(handle);
                    switched = true;
                }
                _ => self.platform.enqueue_ready(handle, priority),
            }
        }
    }
}
