//! Local IPC: register-only messages between threads of one address space,
//! delivered without touching wait queues or timeouts.
//!
//! The path is split by three checkpoints. Each one maps to a fixed
//! recovery action, so an interruption at any of them can be resumed
//! without leaving the two threads in an intermediate state:
//!
//! | checkpoint     | reached after                 | on resume                 |
//! |----------------|-------------------------------|---------------------------|
//! | `RestartPoint` | nothing committed             | rerun the whole request   |
//! | `ForwardPoint` | both threads claimed          | finish the handoff        |
//! | `FinishPoint`  | message delivered             | report the saved result   |

use rendezvous_common::{
    ContextRef, IpcError, MsgDope, ReceiveKind, SendDesc, ThreadIdentifier, TimeoutValue,
    REGISTER_WORDS,
};
use rendezvous_hal::{Handoff, Platform, TraceKind};

use super::message::{IpcOutcome, IpcRequest, IpcStatus, PendingIpc};
use crate::error::{invariant_violation, KernelError};
use crate::thread::{Completion, Source, ThreadState};
use crate::Kernel;

/// Points at which a local IPC can be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    RestartPoint,
    ForwardPoint,
    FinishPoint,
}

/// What resuming an interrupted local IPC does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recovery {
    /// Start the request over.
    Restart,
    /// Complete the handoff that was committed.
    Complete,
    /// Return the result that was already produced.
    Resume,
}

/// The recovery action for every checkpoint.
pub const fn recovery_for(checkpoint: Checkpoint) -> Recovery {
    match checkpoint {
        Checkpoint::RestartPoint => Recovery::Restart,
        Checkpoint::ForwardPoint => Recovery::Complete,
        Checkpoint::FinishPoint => Recovery::Resume,
    }
}

/// Source of interruptions for the local-IPC path.
pub trait Preemption {
    /// Asked at every checkpoint; `true` interrupts the operation there.
    fn preempt_at(&mut self, checkpoint: Checkpoint) -> bool;
}

/// Never interrupts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPreemption;

impl Preemption for NoPreemption {
    fn preempt_at(&mut self, _checkpoint: Checkpoint) -> bool {
        false
    }
}

/// Interrupts once, at the given checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct PreemptAt {
    checkpoint: Checkpoint,
    fired: bool,
}

impl PreemptAt {
    pub fn new(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint,
            fired: false,
        }
    }

    /// True once the interruption happened.
    pub fn fired(&self) -> bool {
        self.fired
    }
}

impl Preemption for PreemptAt {
    fn preempt_at(&mut self, checkpoint: Checkpoint) -> bool {
        if self.fired || checkpoint != self.checkpoint {
            return false;
        }
        self.fired = true;
        true
    }
}

/// Saved progress of an interrupted local IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LipcFrame {
    pub checkpoint: Checkpoint,
    pub request: IpcRequest,
    pub dest: ContextRef,
    /// Result, once the message was delivered.
    pub status: Option<IpcStatus>,
}

impl<P: Platform> Kernel<P> {
    /// Resumes `thread`'s interrupted local IPC once it runs again.
    pub fn resume_local_ipc(
        &mut self,
        thread: ContextRef,
        probe: &mut dyn Preemption,
    ) -> Result<IpcStatus, KernelError> {
        let current = thread;
        let frame = self
            .threads
            .get_mut(current)
            .and_then(|tcb| tcb.lipc_frame.take())
            .ok_or(KernelError::NothingToResume)?;
        log::debug!("lipc: {} resumes at {:?}", current, frame.checkpoint);
        match recovery_for(frame.checkpoint) {
            Recovery::Restart => Ok(self.ipc_from(current, frame.request, probe)),
            Recovery::Complete => Ok(self.complete_local_handoff(current, &frame)),
            Recovery::Resume => frame
                .status
                .ok_or_else(|| {
                    invariant_violation!("lipc frame of {} finished without a result", current)
                }),
        }
    }

    /// The receiver a request can be delivered to over the local path.
    pub(crate) fn local_ipc_target(
        &self,
        current: ContextRef,
        request: &IpcRequest,
    ) -> Option<ContextRef> {
        if !self.config.local_ipc || request.send != Some(SendDesc::REGISTERS) {
            return None;
        }
        if let Some(receive) = request.receive {
            let bounded = request.timeout.receive().value() != TimeoutValue::Never;
            if receive.kind != ReceiveKind::Registers || bounded {
                return None;
            }
        }
        let dest = self.threads.lookup(request.dest)?;
        if dest == current {
            return None;
        }
        let (caller, target) = (self.threads.get(current)?, self.threads.get(dest)?);
        if caller.space != target.space || !target.lipc_ready || caller.lipc_frame.is_some() {
            return None;
        }
        let accepts = match target.state {
            ThreadState::ReceiveBlocked { source: Source::Any } => true,
            ThreadState::ReceiveBlocked {
                source: Source::Thread(from),
            } => from == current,
            _ => false,
        };
        let registers_only = target
            .op
            .and_then(|op| op.receive)
            .is_some_and(|receive| receive.kind == ReceiveKind::Registers);
        if !accepts || !registers_only {
            return None;
        }
        if request.receive.is_some() && !caller.senders.is_empty() {
            return None;
        }
        Some(dest)
    }

    pub(crate) fn local_ipc(
        &mut self,
        current: ContextRef,
        dest: ContextRef,
        request: IpcRequest,
        probe: &mut dyn Preemption,
    ) -> IpcStatus {
        let mut frame = LipcFrame {
            checkpoint: Checkpoint::RestartPoint,
            request,
            dest,
            status: None,
        };
        if probe.preempt_at(Checkpoint::RestartPoint) {
            return self.park(current, frame);
        }

        if let Some(target) = self.threads.get_mut(dest) {
            if let Some(armed) = target.timeout.take() {
                self.timeouts.disarm(armed);
            }
            target.state = ThreadState::InTransfer { partner: current };
        }
        if let Some(caller) = self.threads.get_mut(current) {
            caller.state = ThreadState::InTransfer { partner: dest };
            caller.regs = request.regs;
        }
        frame.checkpoint = Checkpoint::ForwardPoint;
        if probe.preempt_at(Checkpoint::ForwardPoint) {
            return self.park(current, frame);
        }

        let status = self.complete_local_handoff(current, &frame);
        frame.checkpoint = Checkpoint::FinishPoint;
        frame.status = Some(status);
        if probe.preempt_at(Checkpoint::FinishPoint) {
            return self.park(current, frame);
        }
        status
    }

    fn park(&mut self, current: ContextRef, frame: LipcFrame) -> IpcStatus {
        log::debug!("lipc: {} interrupted at {:?}", current, frame.checkpoint);
        if let Some(caller) = self.threads.get_mut(current) {
            caller.lipc_frame = Some(frame);
        }
        IpcStatus::Preempted
    }

    /// Delivers the committed message and moves the caller on to its
    /// receive phase, if it has one.
    pub(crate) fn complete_local_handoff(
        &mut self,
        current: ContextRef,
        frame: &LipcFrame,
    ) -> IpcStatus {
        let request = frame.request;
        let dest = frame.dest;
        let Some(caller_id) = self.thread_id(current) else {
            return IpcStatus::Done(IpcOutcome::failed(IpcError::SendAborted));
        };

        let Some(target) = self.threads.get_mut(dest) else {
            log::debug!("lipc: partner of {} vanished before delivery", current);
            self.emit(TraceKind::Abort, current, None, Some(IpcError::SendAborted));
            if let Some(caller) = self.threads.get_mut(current) {
                caller.state = ThreadState::Ready;
                caller.op = None;
            }
            return IpcStatus::Done(IpcOutcome::failed(IpcError::SendAborted));
        };
        let mut dope = MsgDope::new(REGISTER_WORDS as u32, 0);
        if target.id.same_task(&caller_id) {
            dope = dope.with_src_inside();
        }
        target.utcb.stage(request.regs, caller_id);
        target.regs = request.regs;
        target.lipc_ready = false;
        target.op = None;
        target.state = ThreadState::Ready;
        target.completion = Some(Completion::Ipc(IpcOutcome {
            dope,
            regs: request.regs,
            sender: Some(caller_id),
        }));
        let target_priority = target.priority;
        self.emit(TraceKind::LocalIpc, current, Some(dest), None);

        match request.receive {
            Some(receive) => {
                let source = if receive.open_wait {
                    Source::Any
                } else {
                    Source::Thread(dest)
                };
                if let Some(caller) = self.threads.get_mut(current) {
                    caller.op = Some(PendingIpc {
                        send: None,
                        receive: Some(receive),
                        partner: Some(dest),
                        source,
                        timeout: request.timeout,
                        flags: request.flags,
                        deceit_as: None,
                    });
                    caller.state = ThreadState::ReceiveBlocked { source };
                    caller.lipc_ready = true;
                }
                self.platform.dequeue(current);
                self.platform.switch_to(dest);
                IpcStatus::Blocked
            }
            None => {
                let caller_priority = match self.threads.get_mut(current) {
                    Some(caller) => {
                        caller.state = ThreadState::Ready;
                        caller.op = None;
                        caller.priority
                    }
                    None => 0,
                };
                match self.platform.handoff(dest, true) {
                    Handoff::SwitchTo => {
                        self.platform.enqueue_ready(current, caller_priority);
                        self.platform.switch_to(dest);
                    }
                    Handoff::Enqueue => self.platform.enqueue_ready(dest, target_priority),
                }
                IpcStatus::Done(IpcOutcome::sent())
            }
        }
    }
}
