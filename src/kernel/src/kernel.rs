//! The top-level kernel object.
//!
//! All mutable kernel state (threads, wait queues, timeouts, semaphores,
//! trace ring) is owned by one [`Kernel`]. Every operation runs under
//! `&mut Kernel`, so a single short critical section guards queue
//! mutation and partner matching; [`SharedKernel`] provides that section
//! for callers on several CPUs.

use alloc::vec::Vec;

use rendezvous_common::{ContextRef, IpcError, ThreadId};
use rendezvous_hal::{Platform, TraceKind, TraceRecord, TraceSink};
use spin::Mutex;

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::sync::SemaphoreTable;
use crate::thread::{Completion, Tcb, ThreadTable};
use crate::timeout::TimeoutRegistry;
use crate::trace::TraceBuffer;
use crate::wait_queue::{QueueId, WaitQueue};

/// The IPC core: threads, wait queues, timeouts and semaphores over a
/// platform `P`.
pub struct Kernel<P: Platform> {
    pub(crate) platform: P,
    pub(crate) config: KernelConfig,
    pub(crate) threads: ThreadTable,
    pub(crate) timeouts: TimeoutRegistry,
    pub(crate) semaphores: SemaphoreTable,
    pub(crate) trace: TraceBuffer,
    /// Threads released by the running operation; handed to the scheduler
    /// when it ends.
    pub(crate) woken: Vec<ContextRef>,
    /// Callers whose send phase a receiver completed and that still have to
    /// enter their receive phase.
    pub(crate) pending_receives: Vec<ContextRef>,
}

impl<P: Platform> Kernel<P> {
    /// Creates a kernel with no threads.
    pub fn new(platform: P, config: KernelConfig) -> Self {
        log::debug!(
            "kernel: {} thread slots, trace ring {} records",
            config.max_threads,
            config.trace_capacity
        );
        Self {
            platform,
            threads: ThreadTable::new(config.max_threads),
            timeouts: TimeoutRegistry::new(),
            semaphores: SemaphoreTable::new(),
            trace: TraceBuffer::new(config.trace_capacity, config.trace_mask),
            woken: Vec::new(),
            pending_receives: Vec::new(),
            config,
        }
    }

    /// The platform collaborators.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Mutable access to the platform collaborators.
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Active configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// All live threads.
    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    /// A live thread.
    pub fn thread(&self, handle: ContextRef) -> Option<&Tcb> {
        self.threads.get(handle)
    }

    /// Identifier of a live thread.
    pub fn thread_id(&self, handle: ContextRef) -> Option<ThreadId> {
        self.threads.get(handle).map(Tcb::id)
    }

    /// Resolves an identifier to a live thread.
    pub fn lookup(&self, id: ThreadId) -> Option<ContextRef> {
        self.threads.lookup(id)
    }

    /// Collects the result of a thread's finished blocking operation.
    pub fn take_completion(&mut self, handle: ContextRef) -> Option<Completion> {
        self.threads.get_mut(handle)?.completion.take()
    }

    /// Number of armed timeouts.
    pub fn armed_timeouts(&self) -> usize {
        self.timeouts.len()
    }

    /// Earliest armed timeout.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timeouts.next_deadline()
    }

    /// Removes and returns all buffered trace records.
    pub fn drain_trace(&self) -> Vec<TraceRecord> {
        self.trace.drain()
    }

    /// Trace records lost to a full ring.
    pub fn trace_dropped(&self) -> u64 {
        self.trace.dropped()
    }

    /// The scheduler's current thread, which must be alive.
    pub(crate) fn current(&self) -> Result<ContextRef, KernelError> {
        let current = self.platform.current();
        match self.threads.get(current) {
            Some(_) => Ok(current),
            None => Err(KernelError::NoCurrentThread),
        }
    }

    pub(crate) fn now(&self) -> u64 {
        self.platform.current_micros()
    }

    pub(crate) fn emit(
        &self,
        kind: TraceKind,
        actor: ContextRef,
        partner: Option<ContextRef>,
        outcome: Option<IpcError>,
    ) {
        let record = TraceRecord {
            kind,
            actor,
            partner,
            outcome,
            timestamp: self.now(),
        };
        if !self.trace.record(record) {
            log::trace!("trace: {:?} record for {} not kept", kind, actor);
        }
    }

    /// Runs `f` on a wait queue together with the thread table holding its
    /// links. Returns `None` if the queue's owner is gone.
    pub(crate) fn with_queue<R>(
        &mut self,
        id: QueueId,
        f: impl FnOnce(&mut WaitQueue, &mut ThreadTable) -> R,
    ) -> Option<R> {
        match id {
            QueueId::Senders(owner) => {
                let mut queue = self.threads.get(owner)?.senders;
                let result = f(&mut queue, &mut self.threads);
                if let Some(tcb) = self.threads.get_mut(owner) {
                    tcb.senders = queue;
                }
                Some(result)
            }
            QueueId::Semaphore(sem) => {
                let entry = self.semaphores.get_mut(sem)?;
                Some(f(&mut entry.waiters, &mut self.threads))
            }
        }
    }
}

/// A kernel behind a spin lock, for use from several CPUs.
pub struct SharedKernel<P: Platform> {
    inner: Mutex<Kernel<P>>,
}

impl<P: Platform> SharedKernel<P> {
    /// Wraps a kernel.
    pub fn new(kernel: Kernel<P>) -> Self {
        Self {
            inner: Mutex::new(kernel),
        }
    }

    /// Runs one kernel entry inside the critical section.
    pub fn with<R>(&self, f: impl FnOnce(&mut Kernel<P>) -> R) -> R {
        let mut kernel = self.inner.lock();
        f(&mut kernel)
    }

    /// Unwraps the kernel.
    pub fn into_inner(self) -> Kernel<P> {
        self.inner.into_inner()
    }
}
