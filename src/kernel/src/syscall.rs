//! System-call decoding and dispatch.
//!
//! [`IpcFrame`] is the raw register image of an IPC entry. It is decoded
//! into a [`Syscall`] once, at the boundary, and everything past
//! [`Kernel::dispatch`] works on typed values.

use rendezvous_common::{
    AbsoluteFlags, ReceiveDesc, SendDesc, ThreadId, ThreadIdentifier, Timeout, REGISTER_WORDS,
};
use rendezvous_hal::Platform;

use crate::error::KernelError;
use crate::ipc::message::{IpcRequest, IpcStatus, MessageRegisters};
use crate::sync::{SemStatus, SemaphoreId};
use crate::thread::UserRegisters;
use crate::Kernel;

/// Register image of an IPC system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcFrame {
    /// Destination, or source of a closed receive.
    pub dest: <ThreadId as ThreadIdentifier>::Raw,
    /// Raw send descriptor; all ones for no send phase.
    pub send_desc: u64,
    /// Raw receive descriptor; all ones for no receive phase.
    pub receive_desc: u64,
    pub words: [u64; REGISTER_WORDS],
    pub timeout: u32,
    /// [`AbsoluteFlags`] bits.
    pub flags: u8,
}

/// A decoded system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Ipc(IpcRequest),
    ExchangeRegisters {
        target: ThreadId,
        ip: Option<u64>,
        sp: Option<u64>,
    },
    SemaphoreDown {
        sem: SemaphoreId,
        timeout: Timeout,
    },
    SemaphoreUp {
        sem: SemaphoreId,
    },
    ThreadDelete {
        target: ThreadId,
    },
    WaitNextPeriod {
        at: u64,
    },
    Cancel {
        target: ThreadId,
    },
}

impl Syscall {
    /// Decodes an IPC register frame.
    pub fn from_ipc_frame(frame: &IpcFrame) -> Syscall {
        Syscall::Ipc(IpcRequest {
            dest: ThreadId::from_raw(frame.dest),
            send: SendDesc::from_raw(frame.send_desc),
            receive: ReceiveDesc::from_raw(frame.receive_desc),
            regs: MessageRegisters { words: frame.words },
            timeout: Timeout::from_raw(frame.timeout),
            flags: AbsoluteFlags::from_bits_truncate(frame.flags),
            deceit_as: None,
        })
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Syscall::Ipc(_) => "ipc",
            Syscall::ExchangeRegisters { .. } => "ex_regs",
            Syscall::SemaphoreDown { .. } => "sem_down",
            Syscall::SemaphoreUp { .. } => "sem_up",
            Syscall::ThreadDelete { .. } => "thread_delete",
            Syscall::WaitNextPeriod { .. } => "wait_next_period",
            Syscall::Cancel { .. } => "cancel",
        }
    }
}

/// What a dispatched system call returns to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallResult {
    Ipc(IpcStatus),
    /// Previous instruction and stack pointer.
    Registers(UserRegisters),
    Semaphore(SemStatus),
    /// Whether a cancel found its target blocked.
    Cancelled(bool),
    Done,
    Failed(KernelError),
}

impl<P: Platform> Kernel<P> {
    /// Executes one system call on behalf of the current thread.
    pub fn dispatch(&mut self, call: Syscall) -> SyscallResult {
        log::trace!("syscall: {}", call.name());
        let result = match call {
            Syscall::Ipc(request) => self.ipc(request).map(SyscallResult::Ipc),
            Syscall::ExchangeRegisters { target, ip, sp } => {
                self.exchange_registers(target, ip, sp).map(SyscallResult::Registers)
            }
            Syscall::SemaphoreDown { sem, timeout } => {
                self.semaphore_down(sem, timeout).map(SyscallResult::Semaphore)
            }
            Syscall::SemaphoreUp { sem } => self.semaphore_up(sem).map(SyscallResult::Semaphore),
            Syscall::ThreadDelete { target } => {
                self.delete_thread(target).map(|()| SyscallResult::Done)
            }
            Syscall::WaitNextPeriod { at } => self.wait_next_period(at).map(SyscallResult::Ipc),
            Syscall::Cancel { target } => self.cancel(target).map(SyscallResult::Cancelled),
        };
        result.unwrap_or_else(|err| {
            log::debug!("syscall {} failed: {}", call.name(), err);
            SyscallResult::Failed(err)
        })
    }
}
