//! IPC requests and outcomes.

use rendezvous_common::{
    AbsoluteFlags, ContextRef, IpcError, MsgDope, ReceiveDesc, SendDesc, ThreadId, ThreadIdentifier,
    Timeout, REGISTER_WORDS,
};

use crate::thread::Source;

/// The message words carried in registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageRegisters {
    pub words: [u64; REGISTER_WORDS],
}

impl MessageRegisters {
    /// Registers holding `w0` and `w1`.
    #[inline]
    #[must_use]
    pub const fn new(w0: u64, w1: u64) -> Self {
        Self { words: [w0, w1] }
    }

    /// Word `index`, or zero past the register prefix.
    #[inline]
    #[must_use]
    pub fn word(&self, index: usize) -> u64 {
        self.words.get(index).copied().unwrap_or(0)
    }
}

/// One IPC system call: an optional send phase followed by an optional
/// receive phase.
///
/// With a receive descriptor that is not an open wait, `dest` also names
/// the only acceptable sender; a nil `dest` then just sleeps until the
/// receive timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcRequest {
    pub dest: ThreadId,
    pub send: Option<SendDesc>,
    pub receive: Option<ReceiveDesc>,
    pub regs: MessageRegisters,
    pub timeout: Timeout,
    pub flags: AbsoluteFlags,
    /// Identity to present to a receiver in the same task.
    pub deceit_as: Option<ThreadId>,
}

impl IpcRequest {
    fn new(
        dest: ThreadId,
        send: Option<SendDesc>,
        receive: Option<ReceiveDesc>,
        regs: MessageRegisters,
        timeout: Timeout,
    ) -> Self {
        Self {
            dest,
            send,
            receive,
            regs,
            timeout,
            flags: AbsoluteFlags::empty(),
            deceit_as: None,
        }
    }

    /// Send `regs` to `dest`.
    pub fn send(dest: ThreadId, regs: MessageRegisters, timeout: Timeout) -> Self {
        Self::new(dest, Some(SendDesc::REGISTERS), None, regs, timeout)
    }

    /// Send `regs` to `dest`, then receive its reply.
    pub fn call(dest: ThreadId, regs: MessageRegisters, timeout: Timeout) -> Self {
        Self::new(dest, Some(SendDesc::REGISTERS), Some(ReceiveDesc::REGISTERS), regs, timeout)
    }

    /// Receive from `source` only.
    pub fn receive(source: ThreadId, timeout: Timeout) -> Self {
        Self::new(source, None, Some(ReceiveDesc::REGISTERS), MessageRegisters::default(), timeout)
    }

    /// Receive from anyone.
    pub fn open_wait(timeout: Timeout) -> Self {
        Self::new(
            ThreadId::NIL,
            None,
            Some(ReceiveDesc::OPEN),
            MessageRegisters::default(),
            timeout,
        )
    }

    /// Reply to `dest`, then receive from anyone, without becoming ready
    /// in between.
    pub fn reply_and_wait(dest: ThreadId, regs: MessageRegisters, timeout: Timeout) -> Self {
        Self::new(dest, Some(SendDesc::REGISTERS), Some(ReceiveDesc::OPEN), regs, timeout)
    }

    /// Replaces the send descriptor.
    pub fn with_send(mut self, desc: SendDesc) -> Self {
        self.send = Some(desc);
        self
    }

    /// Replaces the receive descriptor, keeping the open-wait choice.
    pub fn with_receive(mut self, desc: ReceiveDesc) -> Self {
        self.receive = Some(desc);
        self
    }

    /// Marks timeouts absolute.
    pub fn with_flags(mut self, flags: AbsoluteFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Presents `id` as the sender (honored inside the destination's task).
    pub fn deceiving(mut self, id: ThreadId) -> Self {
        self.deceit_as = Some(id);
        self
    }
}

/// What a thread learns at the end of an IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpcOutcome {
    /// Counts, flags and error class.
    pub dope: MsgDope,
    /// Received register words (zero for pure sends).
    pub regs: MessageRegisters,
    /// Who sent the received message.
    pub sender: Option<ThreadId>,
}

impl IpcOutcome {
    /// A successful outcome with nothing received.
    pub fn sent() -> Self {
        Self::default()
    }

    /// An outcome carrying only `error`.
    pub fn failed(error: IpcError) -> Self {
        Self {
            dope: MsgDope::from_error(error),
            ..Self::default()
        }
    }

    /// An outcome that only reports `dope`.
    pub fn with_dope(dope: MsgDope) -> Self {
        Self {
            dope,
            ..Self::default()
        }
    }

    /// Error class, if the IPC failed.
    pub fn error(&self) -> Option<IpcError> {
        self.dope.error()
    }

    /// True if the IPC completed without error.
    pub fn is_ok(&self) -> bool {
        self.dope.is_ok()
    }
}

/// Immediate result of an IPC system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcStatus {
    /// Finished; the caller continues with this outcome.
    Done(IpcOutcome),
    /// The caller blocked. Its outcome is delivered as a
    /// [`Completion`](crate::thread::Completion) when it is released.
    Blocked,
    /// A local IPC was interrupted at a checkpoint; resume it with
    /// [`Kernel::resume_local_ipc`](crate::Kernel::resume_local_ipc).
    Preempted,
}

impl IpcStatus {
    /// The outcome of a finished call.
    pub fn outcome(&self) -> Option<&IpcOutcome> {
        match self {
            IpcStatus::Done(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Parameters of the operation a thread is engaged in, kept while it
/// blocks so the partner can complete it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingIpc {
    pub(crate) send: Option<SendDesc>,
    pub(crate) receive: Option<ReceiveDesc>,
    /// Destination of the send phase.
    pub(crate) partner: Option<ContextRef>,
    /// Filter of the receive phase.
    pub(crate) source: Source,
    pub(crate) timeout: Timeout,
    pub(crate) flags: AbsoluteFlags,
    pub(crate) deceit_as: Option<ThreadId>,
}
