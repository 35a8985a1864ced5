//! Moving one message from a sender to a receiver.
//!
//! Order of work: flexpage first, then buffer words, then indirect
//! strings. A flexpage the receiver has no window for cuts the message on
//! both sides before anything else is copied. Page faults in either buffer
//! are resolved through the pager, bounded by the faulting side's
//! page-fault timeout.

use rendezvous_common::desc::layout;
use rendezvous_common::{
    ContextRef, Fpage, FpageRights, IpcError, MsgDope, ReceiveDesc, ReceiveKind, SendDesc, SendKind,
    SpaceId,
    ThreadId, ThreadIdentifier, TimeoutValue, REGISTER_WORDS,
};
use rendezvous_common::timeout::pf_value;
use rendezvous_hal::{FaultError, MapRequest, PageFault, Platform, TraceKind};

use super::message::{IpcOutcome, MessageRegisters};
use crate::error::invariant_violation;
use crate::thread::ThreadState;
use crate::Kernel;

/// Bytes moved per string chunk.
const STRING_CHUNK: usize = 64;

/// Whose buffer faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Sender,
    Receiver,
}

/// Why a transfer stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    /// A fault in `Side`'s buffer outlived its page-fault timeout.
    PfTimeout(Side),
    /// The pager refused a page.
    Rejected,
    /// A buffer or string runs past the top of the address space.
    Unaddressable,
}

impl Abort {
    /// Error classes reported to (sender, receiver).
    fn errors(self) -> (IpcError, IpcError) {
        match self {
            Abort::PfTimeout(Side::Sender) => {
                (IpcError::SendSendPfTimeout, IpcError::ReceiveSendPfTimeout)
            }
            Abort::PfTimeout(Side::Receiver) => {
                (IpcError::SendReceivePfTimeout, IpcError::ReceiveReceivePfTimeout)
            }
            Abort::Rejected | Abort::Unaddressable => {
                (IpcError::SendAborted, IpcError::ReceiveAborted)
            }
        }
    }
}

/// One side's view of user memory during a transfer.
#[derive(Debug, Clone, Copy)]
struct Party {
    space: SpaceId,
    /// Page-fault timeout field for faults in this side's buffer.
    pf: u8,
    side: Side,
}

/// The fixed words at the start of a long message buffer.
#[derive(Debug, Clone, Copy)]
struct Header {
    buffer: u64,
    fpage_slot: u64,
    size: MsgDope,
    send: MsgDope,
}

impl Header {
    /// Word capacity, never less than the register prefix.
    fn capacity(&self) -> u32 {
        self.size.words().max(REGISTER_WORDS as u32)
    }

    /// Bytes of the buffer either dope may lead the transfer to touch.
    fn span(&self) -> u64 {
        let words = self.capacity().max(self.send.words());
        let strings = self.size.strings().max(self.send.strings());
        layout::span(u64::from(words), u64::from(strings))
    }
}

/// `base + offset`, or an abort if that leaves the address space.
fn offset(base: u64, by: u64) -> Result<u64, Abort> {
    base.checked_add(by).ok_or(Abort::Unaddressable)
}

struct Delivery {
    sender: MsgDope,
    receiver: MsgDope,
    regs: MessageRegisters,
}

impl Delivery {
    fn failed(sender: IpcError, receiver: IpcError) -> Self {
        Self {
            sender: MsgDope::from_error(sender),
            receiver: MsgDope::from_error(receiver),
            regs: MessageRegisters::default(),
        }
    }
}

/// Result of a rendezvous, for both participants.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransferResult {
    pub(crate) sender: MsgDope,
    pub(crate) receiver: IpcOutcome,
}

impl TransferResult {
    fn aborted() -> Self {
        Self {
            sender: MsgDope::from_error(IpcError::SendAborted),
            receiver: IpcOutcome::failed(IpcError::ReceiveAborted),
        }
    }
}

impl<P: Platform> Kernel<P> {
    /// Performs the rendezvous between `sender` and `receiver`, whose
    /// pending operations describe the message.
    pub(crate) fn transfer(&mut self, sender: ContextRef, receiver: ContextRef) -> TransferResult {
        let (Some(s), Some(r)) = (self.threads.get(sender), self.threads.get(receiver)) else {
            let _ = invariant_violation!(
                "transfer between {} and {} with a dead side",
                sender,
                receiver
            );
            return TransferResult::aborted();
        };
        let (Some(s_op), Some(r_op)) = (s.op, r.op) else {
            let _ = invariant_violation!(
                "transfer without pending operations ({} -> {})", sender, receiver
            );
            return TransferResult::aborted();
        };
        let (Some(send), Some(receive)) = (s_op.send, r_op.receive) else {
            let _ = invariant_violation!(
                "transfer {} -> {} lacks a send or receive part", sender, receiver
            );
            return TransferResult::aborted();
        };

        let regs = s.regs;
        let same_task = s.id.same_task(&r.id);
        let deceit = s_op.deceit_as.filter(|_| send.deceite && same_task);
        let reported: ThreadId = deceit.unwrap_or(s.id);
        let src = Party {
            space: s.space,
            pf: s_op.timeout.send_pf(),
            side: Side::Sender,
        };
        let dst = Party {
            space: r.space,
            pf: r_op.timeout.receive_pf(),
            side: Side::Receiver,
        };

        if let Some(tcb) = self.threads.get_mut(sender) {
            tcb.state = ThreadState::InTransfer { partner: receiver };
        }
        if let Some(tcb) = self.threads.get_mut(receiver) {
            tcb.state = ThreadState::InTransfer { partner: sender };
        }

        let delivery = match self.move_message(src, send, regs, dst, receive) {
            Ok(delivery) => delivery,
            Err(abort) => {
                let (sender_error, receiver_error) = abort.errors();
                log::warn!("ipc {} -> {} aborted: {:?}", sender, receiver, abort);
                Delivery::failed(sender_error, receiver_error)
            }
        };

        let mut dope = delivery.receiver;
        if same_task {
            dope = dope.with_src_inside();
        }
        if deceit.is_some() {
            dope = dope.with_deceited();
        }
        if let Some(tcb) = self.threads.get_mut(receiver) {
            tcb.regs = delivery.regs;
        }

        log::trace!(
            "ipc {} -> {}: {} words, {} strings, {:?}",
            sender,
            receiver,
            dope.words(),
            dope.strings(),
            dope.error()
        );
        self.emit(TraceKind::Rendezvous, sender, Some(receiver), dope.error());

        TransferResult {
            sender: delivery.sender,
            receiver: IpcOutcome {
                dope,
                regs: delivery.regs,
                sender: Some(reported),
            },
        }
    }

    fn move_message(
        &mut self,
        src: Party,
        send: SendDesc,
        regs: MessageRegisters,
        dst: Party,
        receive: ReceiveDesc,
    ) -> Result<Delivery, Abort> {
        let send_header = match send.kind {
            SendKind::Long { buffer, .. } => Some(self.read_header(src, buffer)?),
            _ => None,
        };
        let receive_header = match receive.kind {
            ReceiveKind::Long { buffer } => Some(self.read_header(dst, buffer)?),
            _ => None,
        };

        let mut received = MsgDope::default();
        if send.maps() {
            let fpage = match send_header {
                Some(header) => Fpage::from_raw(header.fpage_slot),
                None => Fpage::from_raw(regs.word(1)),
            };
            let window = match receive.kind {
                ReceiveKind::RegisterFpage { window } => Some(window),
                ReceiveKind::Long { .. } => receive_header
                    .map(|header| Fpage::from_raw(header.fpage_slot))
                    .filter(Fpage::is_valid),
                ReceiveKind::Registers => None,
            };
            let Some(window) = window else {
                log::debug!("ipc: flexpage {:#x} but no receive window", fpage.raw());
                return Ok(Delivery::failed(IpcError::SendMessageCut, IpcError::ReceiveMessageCut));
            };
            let Some(placement) = fpage.fit_into(&window, regs.word(0)) else {
                log::debug!(
                    "ipc: flexpage {:#x} does not fit window {:#x}",
                    fpage.raw(),
                    window.raw()
                );
                return Ok(Delivery::failed(IpcError::SendMapFailed, IpcError::ReceiveMapFailed));
            };
            let request = MapRequest {
                from: src.space,
                to: dst.space,
                fpage,
                placement,
                grant: fpage.rights().contains(FpageRights::GRANT),
            };
            if let Err(err) = self.platform.map(&request) {
                log::warn!("ipc: mapping {:#x} into {} failed: {}", fpage.raw(), dst.space, err);
                return Ok(Delivery::failed(IpcError::SendMapFailed, IpcError::ReceiveMapFailed));
            }
            received = received.with_fpage_received();
        }

        let offered = send_header.map_or(REGISTER_WORDS as u32, |header| {
            header.send.words().max(REGISTER_WORDS as u32)
        });
        let capacity = receive_header.map_or(REGISTER_WORDS as u32, |header| header.capacity());
        let words = offered.min(capacity);
        let mut cut = offered > capacity;

        if let (Some(from), Some(to)) = (send_header, receive_header) {
            for index in REGISTER_WORDS as u64..u64::from(words) {
                let word = self.read_user(src, layout::word(from.buffer, index))?;
                self.write_user(dst, layout::word(to.buffer, index), word)?;
            }
        }

        let offered_strings = send_header.map_or(0, |header| header.send.strings());
        let string_slots = receive_header.map_or(0, |header| header.size.strings());
        let strings = offered_strings.min(string_slots);
        cut |= offered_strings > strings;

        if let (Some(from), Some(to)) = (send_header, receive_header) {
            for index in 0..u64::from(strings) {
                let source = layout::string(from.buffer, u64::from(from.capacity()), index);
                let target = layout::string(to.buffer, u64::from(to.capacity()), index);
                let len = self.read_user(src, source + layout::SND_SIZE)?;
                let from_addr = self.read_user(src, source + layout::SND_PTR)?;
                let room = self.read_user(dst, target + layout::RCV_SIZE)?;
                let to_addr = self.read_user(dst, target + layout::RCV_PTR)?;
                let moved = len.min(room);
                self.copy_string(src, from_addr, dst, to_addr, moved)?;
                self.write_user(dst, target + layout::SND_SIZE, moved)?;
                self.write_user(dst, target + layout::SND_PTR, to_addr)?;
                cut |= len > room;
            }
        }

        received = received.combine(MsgDope::new(words, strings));
        let mut sent = MsgDope::default();
        if cut {
            log::debug!(
                "ipc: message cut ({} of {} words, {} of {} strings)",
                words,
                offered,
                strings,
                offered_strings
            );
            sent = sent.with_error(IpcError::SendMessageCut);
            received = received.with_error(IpcError::ReceiveMessageCut);
        }
        Ok(Delivery {
            sender: sent,
            receiver: received,
            regs,
        })
    }

    fn read_header(&mut self, party: Party, buffer: u64) -> Result<Header, Abort> {
        offset(buffer, layout::WORDS)?;
        let header = Header {
            buffer,
            fpage_slot: self.read_user(party, buffer + layout::FPAGE_SLOT)?,
            size: MsgDope::from_raw(self.read_user(party, buffer + layout::SIZE_DOPE)? as u32),
            send: MsgDope::from_raw(self.read_user(party, buffer + layout::SEND_DOPE)? as u32),
        };
        if offset(buffer, header.span()).is_err() {
            log::debug!("ipc: buffer {:#x} in {} wraps the address space", buffer, party.space);
            return Err(Abort::Unaddressable);
        }
        Ok(header)
    }

    fn read_user(&mut self, party: Party, address: u64) -> Result<u64, Abort> {
        self.resolve_faults(party, |platform| platform.read_word(party.space, address))
    }

    fn write_user(&mut self, party: Party, address: u64, value: u64) -> Result<(), Abort> {
        self.resolve_faults(party, |platform| platform.write_word(party.space, address, value))
    }

    fn copy_string(
        &mut self,
        src: Party,
        from: u64,
        dst: Party,
        to: u64,
        len: u64,
    ) -> Result<(), Abort> {
        if offset(from, len).is_err() || offset(to, len).is_err() {
            log::debug!("ipc: string of {} bytes at {:#x} -> {:#x} wraps", len, from, to);
            return Err(Abort::Unaddressable);
        }
        let mut chunk = [0u8; STRING_CHUNK];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(STRING_CHUNK as u64) as usize;
            let buf = &mut chunk[..n];
            self.resolve_faults(src, |platform| {
                platform.read_bytes(src.space, from + done, &mut *buf)
            })?;
            let buf = &chunk[..n];
            self.resolve_faults(dst, |platform| platform.write_bytes(dst.space, to + done, buf))?;
            done += n as u64;
        }
        Ok(())
    }

    /// Retries `access` until it stops faulting, asking the pager for each
    /// fault.
    fn resolve_faults<T>(
        &mut self,
        party: Party,
        mut access: impl FnMut(&mut P) -> Result<T, PageFault>,
    ) -> Result<T, Abort> {
        let budget = pf_value(party.pf);
        let started = self.now();
        let mut attempts = 0u32;
        loop {
            let fault = match access(&mut self.platform) {
                Ok(value) => return Ok(value),
                Err(fault) => fault,
            };
            attempts += 1;
            if budget == TimeoutValue::Zero || attempts > self.config.fault_retries {
                log::debug!(
                    "page fault at {:#x} in {} not resolved in time",
                    fault.address,
                    fault.space
                );
                return Err(Abort::PfTimeout(party.side));
            }
            log::trace!(
                "page fault at {:#x} in {} ({:?})",
                fault.address,
                fault.space,
                fault.access
            );
            match self.platform.resolve_page_fault(fault.space, fault.address, fault.access) {
                Ok(()) => {
                    if let TimeoutValue::Micros(limit) = budget {
                        if self.now().saturating_sub(started) > limit {
                            return Err(Abort::PfTimeout(party.side));
                        }
                    }
                }
                Err(FaultError::Timeout) => return Err(Abort::PfTimeout(party.side)),
                Err(FaultError::Rejected) => {
                    log::warn!("pager rejected fault at {:#x} in {}", fault.address, fault.space);
                    return Err(Abort::Rejected);
                }
            }
        }
    }
}
