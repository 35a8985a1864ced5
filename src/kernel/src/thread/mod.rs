//! Execution contexts and their blocking states.
//!
//! A [`Tcb`] lives in the [`ThreadTable`] arena and is named by a
//! [`ContextRef`]. Everything that points at a thread (wait-queue links,
//! timeout registrations, partner fields) holds such a handle, never a
//! reference.

mod lifecycle;
mod table;

pub use table::ThreadTable;

use rendezvous_common::{ContextRef, SpaceId, ThreadId};

use crate::config::DEFAULT_PRIORITY;
use crate::ipc::lipc::LipcFrame;
use crate::ipc::message::{IpcOutcome, MessageRegisters, PendingIpc};
use crate::sync::{SemOutcome, SemaphoreId};
use crate::timeout::TimeoutHandle;
use crate::wait_queue::{QueueId, QueueLink, WaitQueue};

/// Which senders a blocked receiver accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Open wait: the first queued sender.
    Any,
    /// Closed wait: only this thread.
    Thread(ContextRef),
    /// Closed wait on the nil identifier; nothing ever matches.
    Nil,
    /// Not an IPC wait: blocked in `down` on a semaphore.
    Semaphore(SemaphoreId),
}

/// Protocol state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Runnable; not taking part in any operation.
    Ready,
    /// Queued on `partner`'s sender queue.
    SendBlocked { partner: ContextRef },
    /// Waiting for a message (or a semaphore unit) from `source`.
    ReceiveBlocked { source: Source },
    /// Rendezvous reached; data is being moved.
    InTransfer { partner: ContextRef },
    /// Sleeping until the start of its next period.
    PeriodicWait,
}

impl ThreadState {
    /// True for the states a thread can only leave through another
    /// thread, a timeout or cancellation.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            ThreadState::SendBlocked { .. }
                | ThreadState::ReceiveBlocked { .. }
                | ThreadState::PeriodicWait
        )
    }
}

/// User-visible instruction and stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserRegisters {
    pub ip: u64,
    pub sp: u64,
}

/// Per-thread scratch area the local-IPC path stages messages in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Utcb {
    staged: MessageRegisters,
    staged_from: Option<ThreadId>,
}

impl Utcb {
    /// Registers deposited by the last local IPC.
    pub fn staged(&self) -> MessageRegisters {
        self.staged
    }

    /// Sender of the last local IPC.
    pub fn staged_from(&self) -> Option<ThreadId> {
        self.staged_from
    }

    pub(crate) fn stage(&mut self, regs: MessageRegisters, from: ThreadId) {
        self.staged = regs;
        self.staged_from = Some(from);
    }
}

/// Terminal result of a blocking operation, picked up by the thread once it
/// runs again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Ipc(IpcOutcome),
    Semaphore(SemOutcome),
}

/// Parameters for [`Kernel::create_thread`](crate::Kernel::create_thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadParams {
    pub task: u32,
    pub lthread: u32,
    pub space: SpaceId,
    pub priority: u8,
}

impl ThreadParams {
    /// Thread `lthread` of `task`, running in `space` at default priority.
    pub fn new(task: u32, lthread: u32, space: SpaceId) -> Self {
        Self {
            task,
            lthread,
            space,
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Overrides the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Thread control block.
#[derive(Debug)]
pub struct Tcb {
    pub(crate) id: ThreadId,
    pub(crate) space: SpaceId,
    pub(crate) priority: u8,
    pub(crate) state: ThreadState,
    pub(crate) link: QueueLink,
    pub(crate) senders: WaitQueue,
    pub(crate) timeout: Option<TimeoutHandle>,
    pub(crate) op: Option<PendingIpc>,
    pub(crate) completion: Option<Completion>,
    pub(crate) regs: MessageRegisters,
    pub(crate) user: UserRegisters,
    pub(crate) utcb: Utcb,
    /// May be the target of a local IPC; set when blocking in a receive,
    /// cleared once a local IPC delivered to it.
    pub(crate) lipc_ready: bool,
    pub(crate) lipc_frame: Option<LipcFrame>,
}

impl Tcb {
    pub(crate) fn new(id: ThreadId, params: &ThreadParams, owner: ContextRef) -> Self {
        Self {
            id,
            space: params.space,
            priority: params.priority,
            state: ThreadState::Ready,
            link: QueueLink::default(),
            senders: WaitQueue::new(QueueId::Senders(owner)),
            timeout: None,
            op: None,
            completion: None,
            regs: MessageRegisters::default(),
            user: UserRegisters::default(),
            utcb: Utcb::default(),
            lipc_ready: false,
            lipc_frame: None,
        }
    }

    /// The thread's identifier.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Address space the thread runs in.
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Scheduling priority.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Protocol state.
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Message registers as last sent or received.
    pub fn registers(&self) -> MessageRegisters {
        self.regs
    }

    /// Instruction and stack pointer.
    pub fn user_registers(&self) -> UserRegisters {
        self.user
    }

    /// Local-IPC staging area.
    pub fn utcb(&self) -> &Utcb {
        &self.utcb
    }

    /// Wait-queue membership.
    pub fn queue(&self) -> Option<QueueId> {
        self.link.queue()
    }

    /// Senders currently queued on this thread.
    pub fn sender_queue(&self) -> &WaitQueue {
        &self.senders
    }

    /// Deadline of the armed timeout, if any.
    pub fn timeout_deadline(&self) -> Option<u64> {
        self.timeout.as_ref().map(TimeoutHandle::deadline)
    }

    /// True if a local IPC may be delivered to this thread.
    pub fn accepts_local_ipc(&self) -> bool {
        self.lipc_ready
    }

    /// Result of the last completed blocking operation, not yet collected.
    pub fn pending_completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }
}
