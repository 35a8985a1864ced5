//! Synchronous rendezvous IPC.
//!
//! An IPC is a send phase to `dest` followed by a receive phase. Whichever
//! side arrives second performs the transfer: a sender finding its
//! receiver waiting copies straight into it, a receiver finding a sender
//! queued pulls the message out of it. A caller whose send phase was
//! completed by the receiver goes straight into its receive phase, without
//! passing through `Ready`, so a server's reply cannot overtake it.

pub mod lipc;
pub mod message;
mod transfer;

use rendezvous_common::{
    ContextRef, Deadline, IpcError, MsgDope, ReceiveDesc, ThreadId, ThreadIdentifier, Timeout,
};
use rendezvous_hal::Platform;

use self::lipc::{NoPreemption, Preemption};
use self::message::{IpcOutcome, IpcRequest, IpcStatus, MessageRegisters, PendingIpc};
use crate::error::KernelError;
use crate::thread::{Completion, Source, ThreadState};
use crate::wait_queue::QueueId;
use crate::Kernel;

/// Result of the send phase.
enum SendPhase {
    Done(MsgDope),
    Blocked,
}

impl<P: Platform> Kernel<P> {
    /// Performs an IPC system call for the current thread.
    pub fn ipc(&mut self, request: IpcRequest) -> Result<IpcStatus, KernelError> {
        self.ipc_preemptible(request, &mut NoPreemption)
    }

    /// Like [`ipc`](Self::ipc), asking `probe` at each local-IPC checkpoint
    /// whether to interrupt.
    pub fn ipc_preemptible(
        &mut self,
        request: IpcRequest,
        probe: &mut dyn Preemption,
    ) -> Result<IpcStatus, KernelError> {
        let current = self.current()?;
        Ok(self.ipc_from(current, request, probe))
    }

    /// Sends `regs` to `dest`.
    pub fn send(
        &mut self,
        dest: ThreadId,
        regs: MessageRegisters,
        timeout: Timeout,
    ) -> Result<IpcStatus, KernelError> {
        self.ipc(IpcRequest::send(dest, regs, timeout))
    }

    /// Sends `regs` to `dest` and waits for its reply.
    pub fn call(
        &mut self,
        dest: ThreadId,
        regs: MessageRegisters,
        timeout: Timeout,
    ) -> Result<IpcStatus, KernelError> {
        self.ipc(IpcRequest::call(dest, regs, timeout))
    }

    /// Receives from `source` only; a nil `source` sleeps for the timeout.
    pub fn receive(
        &mut self,
        source: ThreadId,
        timeout: Timeout,
    ) -> Result<IpcStatus, KernelError> {
        self.ipc(IpcRequest::receive(source, timeout))
    }

    /// Receives from any sender.
    pub fn open_wait(&mut self, timeout: Timeout) -> Result<IpcStatus, KernelError> {
        self.ipc(IpcRequest::open_wait(timeout))
    }

    /// Replies to `dest` and waits for the next request from anyone.
    pub fn reply_and_wait(
        &mut self,
        dest: ThreadId,
        regs: MessageRegisters,
        timeout: Timeout,
    ) -> Result<IpcStatus, KernelError> {
        self.ipc(IpcRequest::reply_and_wait(dest, regs, timeout))
    }

    pub(crate) fn ipc_from(
        &mut self,
        current: ContextRef,
        request: IpcRequest,
        probe: &mut dyn Preemption,
    ) -> IpcStatus {
        if let Some(dest) = self.local_ipc_target(current, &request) {
            return self.local_ipc(current, dest, request, probe);
        }
        self.ipc_slow(current, request)
    }

    fn ipc_slow(&mut self, current: ContextRef, request: IpcRequest) -> IpcStatus {
        if request.send.is_none() && request.receive.is_none() {
            return IpcStatus::Done(IpcOutcome::sent());
        }

        let partner = match request.send {
            Some(_) => match self.threads.lookup(request.dest) {
                Some(partner) => Some(partner),
                None => {
                    log::debug!("ipc: {} sends to unknown {}", current, request.dest);
                    return self.finish(current, IpcOutcome::failed(IpcError::NotExistent));
                }
            },
            None => None,
        };
        let source = match request.receive {
            None => Source::Nil,
            Some(ReceiveDesc { open_wait: true, .. }) => Source::Any,
            Some(_) if request.dest.is_nil() => Source::Nil,
            Some(_) => match partner.or_else(|| self.threads.lookup(request.dest)) {
                Some(from) => Source::Thread(from),
                None => return self.finish(current, IpcOutcome::failed(IpcError::NotExistent)),
            },
        };

        if let Some(tcb) = self.threads.get_mut(current) {
            tcb.regs = request.regs;
            tcb.completion = None;
            tcb.op = Some(PendingIpc {
                send: request.send,
                receive: request.receive,
                partner,
                source,
                timeout: request.timeout,
                flags: request.flags,
                deceit_as: request.deceit_as,
            });
        }

        if let Some(partner) = partner {
            match self.send_phase(current, partner) {
                SendPhase::Done(dope) => {
                    if dope.send_error() || request.receive.is_none() {
                        return self.finish(current, IpcOutcome::with_dope(dope));
                    }
                }
                SendPhase::Blocked => {
                    self.run_pending_receives();
                    self.settle(Some(current), false);
                    return IpcStatus::Blocked;
                }
            }
        }

        match self.receive_phase(current) {
            Some(outcome) => self.finish(current, outcome),
            None => {
                self.run_pending_receives();
                self.settle(Some(current), false);
                IpcStatus::Blocked
            }
        }
    }

    /// Ends the calling thread's IPC without blocking.
    fn finish(&mut self, current: ContextRef, outcome: IpcOutcome) -> IpcStatus {
        if let Some(tcb) = self.threads.get_mut(current) {
            tcb.state = ThreadState::Ready;
            tcb.op = None;
        }
        self.run_pending_receives();
        self.settle(Some(current), true);
        IpcStatus::Done(outcome)
    }

    fn send_phase(&mut self, current: ContextRef, partner: ContextRef) -> SendPhase {
        if self.accepts(partner, current) {
            let result = self.transfer(current, partner);
            self.release(partner, Completion::Ipc(result.receiver));
            return SendPhase::Done(result.sender);
        }

        let Some(op) = self.threads.get(current).and_then(|tcb| tcb.op) else {
            return SendPhase::Done(MsgDope::from_error(IpcError::SendAborted));
        };
        let deadline = op.timeout.send_deadline(self.now(), op.flags);
        if deadline == Deadline::Expired {
            log::trace!("ipc: {} -> {} not waiting, send timeout", current, partner);
            return SendPhase::Done(MsgDope::from_error(IpcError::SendTimeout));
        }
        let queued = self.with_queue(QueueId::Senders(partner), |queue, threads| {
            queue.enqueue(threads, current)
        });
        if !matches!(queued, Some(Ok(()))) {
            return SendPhase::Done(MsgDope::from_error(IpcError::SendAborted));
        }
        self.block(current, ThreadState::SendBlocked { partner }, deadline);
        SendPhase::Blocked
    }

    /// True if `receiver` is waiting for a message `sender` may deliver.
    fn accepts(&self, receiver: ContextRef, sender: ContextRef) -> bool {
        match self.threads.get(receiver).map(|tcb| tcb.state) {
            Some(ThreadState::ReceiveBlocked { source: Source::Any }) => true,
            Some(ThreadState::ReceiveBlocked {
                source: Source::Thread(from),
            }) => from == sender,
            _ => false,
        }
    }

    /// Receives from a queued sender, or blocks. Returns the outcome if the
    /// phase finished without blocking.
    fn receive_phase(&mut self, receiver: ContextRef) -> Option<IpcOutcome> {
        let tcb = self.threads.get(receiver)?;
        let op = tcb.op?;
        let candidate = match op.source {
            Source::Any => tcb.senders.first(),
            Source::Thread(from) if tcb.senders.contains(&self.threads, from) => Some(from),
            _ => None,
        };

        if let Some(sender) = candidate {
            let _ = self.with_queue(QueueId::Senders(receiver), |queue, threads| {
                queue.remove(threads, sender)
            });
            if let Some(armed) = self.threads.get_mut(sender).and_then(|tcb| tcb.timeout.take()) {
                self.timeouts.disarm(armed);
            }
            let result = self.transfer(sender, receiver);
            self.complete_send_phase(sender, result.sender);
            return Some(result.receiver);
        }

        let deadline = op.timeout.receive_deadline(self.now(), op.flags);
        if deadline == Deadline::Expired {
            return Some(IpcOutcome::failed(IpcError::ReceiveTimeout));
        }
        self.block(receiver, ThreadState::ReceiveBlocked { source: op.source }, deadline);
        None
    }

    /// A receiver finished `sender`'s send phase. Senders without a receive
    /// part are released; the others move on to receiving.
    fn complete_send_phase(&mut self, sender: ContextRef, dope: MsgDope) {
        let wants_reply = self
            .threads
            .get(sender)
            .and_then(|tcb| tcb.op)
            .is_some_and(|op| op.receive.is_some());
        if dope.send_error() || !wants_reply {
            self.release(sender, Completion::Ipc(IpcOutcome::with_dope(dope)));
        } else {
            self.pending_receives.push(sender);
        }
    }

    fn run_pending_receives(&mut self) {
        while let Some(caller) = self.pending_receives.pop() {
            if self.threads.get(caller).is_none() {
                continue;
            }
            if let Some(outcome) = self.receive_phase(caller) {
                self.release(caller, Completion::Ipc(outcome));
            }
        }
    }
}
