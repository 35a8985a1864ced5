//! End-to-end IPC scenarios on the simulated platform.

use rendezvous_common::desc::layout;
use rendezvous_common::{
    ContextRef, Fpage, FpageRights, IpcError, MsgDope, ReceiveDesc, ReceiveKind, SendDesc, SendKind,
    SpaceId,
    ThreadId, ThreadIdentifier, Timeout, TimeoutField,
};
use rendezvous_hal::{MapError, Scheduler};
use rendezvous_kernel::testutil::{PagerPolicy, SimPlatform};
use rendezvous_kernel::{
    Completion, IpcOutcome, IpcRequest, IpcStatus, Kernel, KernelConfig, KernelError,
    MessageRegisters, Source,
    ThreadParams, ThreadState,
};

const SEND_BUF: u64 = 0x10_000;
const RECV_BUF: u64 = 0x20_000;

fn kernel() -> Kernel<SimPlatform> {
    // Cross-space threads never take the local path; keep it on anyway.
    Kernel::new(SimPlatform::new(), KernelConfig::default())
}

fn spawn(k: &mut Kernel<SimPlatform>, task: u32, space: u32) -> (ContextRef, ThreadId) {
    let handle = k.create_thread(ThreadParams::new(task, 0, SpaceId(space))).unwrap();
    (handle, k.thread_id(handle).unwrap())
}

fn run_as(k: &mut Kernel<SimPlatform>, thread: ContextRef) {
    k.platform_mut().set_current(thread);
}

fn done(status: Result<IpcStatus, KernelError>) -> IpcOutcome {
    match status {
        Ok(IpcStatus::Done(outcome)) => outcome,
        other => panic!("expected a finished ipc, got {:?}", other),
    }
}

fn completion(k: &mut Kernel<SimPlatform>, thread: ContextRef) -> IpcOutcome {
    match k.take_completion(thread) {
        Some(Completion::Ipc(outcome)) => outcome,
        other => panic!("expected an ipc completion for {}, got {:?}", thread, other),
    }
}

fn write_header(
    k: &mut Kernel<SimPlatform>,
    space: u32,
    buffer: u64,
    fpage: u64,
    size: MsgDope,
    send: MsgDope,
) {
    k.platform_mut()
        .poke_words(SpaceId(space), buffer, &[fpage, u64::from(size.raw()), u64::from(send.raw())]);
}

fn long_send(buffer: u64) -> SendDesc {
    SendDesc {
        kind: SendKind::Long { buffer, map: false },
        deceite: false,
    }
}

fn long_receive(buffer: u64) -> ReceiveDesc {
    ReceiveDesc {
        kind: ReceiveKind::Long { buffer },
        open_wait: true,
    }
}

#[test]
fn test_send_to_waiting_receiver() {
    let mut k = kernel();
    let (a, a_id) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, b);
    assert_eq!(k.open_wait(Timeout::NEVER), Ok(IpcStatus::Blocked));
    assert_eq!(k.thread(b).unwrap().state(), ThreadState::ReceiveBlocked { source: Source::Any });

    run_as(&mut k, a);
    let sent = done(k.send(b_id, MessageRegisters::new(0x10, 0x45), Timeout::NEVER));
    assert!(sent.is_ok());
    assert_eq!(sent.dope.words(), 0);

    let got = completion(&mut k, b);
    assert!(got.is_ok());
    assert_eq!(got.dope.words(), 2);
    assert_eq!(got.regs, MessageRegisters::new(0x10, 0x45));
    assert_eq!(got.sender, Some(a_id));
    assert_eq!(k.thread(b).unwrap().state(), ThreadState::Ready);
    assert_eq!(k.thread(a).unwrap().state(), ThreadState::Ready);
}

#[test]
fn test_zero_timeout_send_does_not_queue() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, a);
    let outcome = done(k.send(b_id, MessageRegisters::new(1, 2), Timeout::ZERO));
    assert_eq!(outcome.error(), Some(IpcError::SendTimeout));
    assert!(k.thread(b).unwrap().sender_queue().is_empty());
    assert_eq!(k.thread(a).unwrap().queue(), None);
    assert_eq!(k.armed_timeouts(), 0);
}

#[test]
fn test_send_to_unknown_thread() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    run_as(&mut k, a);
    let outcome = done(k.send(
        ThreadId::from_parts(77, 3, 1),
        MessageRegisters::default(),
        Timeout::NEVER,
    ));
    assert_eq!(outcome.error(), Some(IpcError::NotExistent));
}

#[test]
fn test_receiver_pulls_queued_sender() {
    let mut k = kernel();
    let (a, a_id) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, a);
    assert_eq!(k.send(b_id, MessageRegisters::new(7, 8), Timeout::NEVER), Ok(IpcStatus::Blocked));
    assert_eq!(k.thread(a).unwrap().state(), ThreadState::SendBlocked { partner: b });
    assert_eq!(k.thread(b).unwrap().sender_queue().len(), 1);

    run_as(&mut k, b);
    let got = done(k.open_wait(Timeout::NEVER));
    assert_eq!(got.regs, MessageRegisters::new(7, 8));
    assert_eq!(got.sender, Some(a_id));
    assert!(k.thread(b).unwrap().sender_queue().is_empty());

    assert!(completion(&mut k, a).is_ok());
    assert_eq!(k.thread(a).unwrap().state(), ThreadState::Ready);
}

#[test]
fn test_call_and_reply() {
    let mut k = kernel();
    let (client, client_id) = spawn(&mut k, 1, 1);
    let (server, server_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, server);
    assert_eq!(k.open_wait(Timeout::NEVER), Ok(IpcStatus::Blocked));

    run_as(&mut k, client);
    assert_eq!(
        k.call(server_id, MessageRegisters::new(1, 2), Timeout::NEVER),
        Ok(IpcStatus::Blocked)
    );
    assert_eq!(
        k.thread(client).unwrap().state(),
        ThreadState::ReceiveBlocked {
            source: Source::Thread(server)
        }
    );
    // The server was handed the CPU directly.
    assert_eq!(k.platform().current(), server);

    let request = completion(&mut k, server);
    assert_eq!(request.regs, MessageRegisters::new(1, 2));
    assert_eq!(request.sender, Some(client_id));

    assert_eq!(
        k.reply_and_wait(client_id, MessageRegisters::new(3, 4), Timeout::NEVER),
        Ok(IpcStatus::Blocked)
    );
    let reply = completion(&mut k, client);
    assert_eq!(reply.regs, MessageRegisters::new(3, 4));
    assert_eq!(reply.sender, Some(server_id));
    assert_eq!(k.platform().current(), client);
    assert_eq!(
        k.thread(server).unwrap().state(),
        ThreadState::ReceiveBlocked { source: Source::Any }
    );
}

#[test]
fn test_pulled_caller_goes_straight_to_receive() {
    let mut k = kernel();
    let (client, _) = spawn(&mut k, 1, 1);
    let (server, server_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, client);
    assert_eq!(
        k.call(server_id, MessageRegisters::new(5, 6), Timeout::NEVER),
        Ok(IpcStatus::Blocked)
    );

    run_as(&mut k, server);
    let request = done(k.open_wait(Timeout::NEVER));
    assert_eq!(request.regs, MessageRegisters::new(5, 6));

    // No Ready window between the two phases.
    assert_eq!(
        k.thread(client).unwrap().state(),
        ThreadState::ReceiveBlocked {
            source: Source::Thread(server)
        }
    );
    assert!(k.thread(client).unwrap().pending_completion().is_none());
}

#[test]
fn test_closed_receive_skips_other_senders() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (c, c_id) = spawn(&mut k, 3, 3);
    let (b, b_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, a);
    assert_eq!(k.send(b_id, MessageRegisters::new(1, 1), Timeout::NEVER), Ok(IpcStatus::Blocked));
    run_as(&mut k, c);
    assert_eq!(k.send(b_id, MessageRegisters::new(3, 3), Timeout::NEVER), Ok(IpcStatus::Blocked));

    run_as(&mut k, b);
    let got = done(k.receive(c_id, Timeout::NEVER));
    assert_eq!(got.regs, MessageRegisters::new(3, 3));
    assert_eq!(k.thread(b).unwrap().sender_queue().to_vec(k.threads()), vec![a]);
}

#[test]
fn test_long_message_within_capacity() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, _) = spawn(&mut k, 2, 2);
    let b_id = k.thread_id(b).unwrap();

    write_header(&mut k, 1, SEND_BUF, 0, MsgDope::new(8, 0), MsgDope::new(6, 0));
    k.platform_mut()
        .poke_words(SpaceId(1), layout::word(SEND_BUF, 2), &[0xa, 0xb, 0xc, 0xd]);
    write_header(&mut k, 2, RECV_BUF, 0, MsgDope::new(8, 0), MsgDope::default());
    k.platform_mut().map_page(SpaceId(2), RECV_BUF);

    run_as(&mut k, b);
    let wait = IpcRequest::open_wait(Timeout::NEVER).with_receive(long_receive(RECV_BUF));
    assert_eq!(k.ipc(wait), Ok(IpcStatus::Blocked));

    run_as(&mut k, a);
    let send = IpcRequest::send(b_id, MessageRegisters::new(1, 2), Timeout::NEVER)
        .with_send(long_send(SEND_BUF));
    assert!(done(k.ipc(send)).is_ok());

    let got = completion(&mut k, b);
    assert!(got.is_ok());
    assert_eq!(got.dope.words(), 6);
    assert_eq!(got.regs, MessageRegisters::new(1, 2));
    for (i, expected) in [0xa, 0xb, 0xc, 0xd].into_iter().enumerate() {
        assert_eq!(
            k.platform().peek_word(SpaceId(2), layout::word(RECV_BUF, 2 + i as u64)),
            Some(expected)
        );
    }
}

#[test]
fn test_long_message_is_cut_to_receiver_capacity() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);

    write_header(&mut k, 1, SEND_BUF, 0, MsgDope::new(8, 0), MsgDope::new(6, 0));
    k.platform_mut()
        .poke_words(SpaceId(1), layout::word(SEND_BUF, 2), &[0xa, 0xb, 0xc, 0xd]);
    write_header(&mut k, 2, RECV_BUF, 0, MsgDope::new(4, 0), MsgDope::default());
    k.platform_mut().poke_words(SpaceId(2), layout::word(RECV_BUF, 2), &[0, 0, 0]);

    run_as(&mut k, b);
    let wait = IpcRequest::open_wait(Timeout::NEVER).with_receive(long_receive(RECV_BUF));
    assert_eq!(k.ipc(wait), Ok(IpcStatus::Blocked));

    run_as(&mut k, a);
    let send = IpcRequest::send(b_id, MessageRegisters::new(1, 2), Timeout::NEVER)
        .with_send(long_send(SEND_BUF));
    let sent = done(k.ipc(send));
    assert_eq!(sent.error(), Some(IpcError::SendMessageCut));

    let got = completion(&mut k, b);
    assert_eq!(got.error(), Some(IpcError::ReceiveMessageCut));
    assert_eq!(got.dope.words(), 4);
    let space = SpaceId(2);
    assert_eq!(k.platform().peek_word(space, layout::word(RECV_BUF, 2)), Some(0xa));
    assert_eq!(k.platform().peek_word(space, layout::word(RECV_BUF, 3)), Some(0xb));
    // Past the capacity nothing is written.
    assert_eq!(k.platform().peek_word(space, layout::word(RECV_BUF, 4)), Some(0));
}

#[test]
fn test_indirect_string_truncated() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);
    let source_text = 0x30_000;
    let target_text = 0x40_000;

    write_header(&mut k, 1, SEND_BUF, 0, MsgDope::new(4, 1), MsgDope::new(2, 1));
    let send_string = layout::string(SEND_BUF, 4, 0);
    k.platform_mut().poke_words(SpaceId(1), send_string, &[10, source_text]);
    k.platform_mut().poke_bytes(SpaceId(1), source_text, b"helloworld");

    write_header(&mut k, 2, RECV_BUF, 0, MsgDope::new(4, 1), MsgDope::default());
    let recv_string = layout::string(RECV_BUF, 4, 0);
    k.platform_mut().poke_words(SpaceId(2), recv_string, &[0, 0, 6, target_text]);

    run_as(&mut k, b);
    let wait = IpcRequest::open_wait(Timeout::NEVER).with_receive(long_receive(RECV_BUF));
    assert_eq!(k.ipc(wait), Ok(IpcStatus::Blocked));

    run_as(&mut k, a);
    let send = IpcRequest::send(b_id, MessageRegisters::new(1, 2), Timeout::NEVER)
        .with_send(long_send(SEND_BUF));
    assert_eq!(done(k.ipc(send)).error(), Some(IpcError::SendMessageCut));

    let got = completion(&mut k, b);
    assert_eq!(got.error(), Some(IpcError::ReceiveMessageCut));
    assert_eq!(got.dope.strings(), 1);
    let platform = k.platform();
    // The target page did not exist; the pager supplied it.
    assert_eq!(platform.peek_bytes(SpaceId(2), target_text, 6).unwrap(), b"hellow");
    assert_eq!(platform.peek_word(SpaceId(2), recv_string + layout::SND_SIZE), Some(6));
    assert_eq!(platform.peek_word(SpaceId(2), recv_string + layout::SND_PTR), Some(target_text));
    assert!(!platform.faults.is_empty());
}

#[test]
fn test_string_past_address_space_end_aborts() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);

    write_header(&mut k, 1, SEND_BUF, 0, MsgDope::new(4, 1), MsgDope::new(2, 1));
    let send_string = layout::string(SEND_BUF, 4, 0);
    k.platform_mut().poke_words(SpaceId(1), send_string, &[128, u64::MAX - 63]);
    write_header(&mut k, 2, RECV_BUF, 0, MsgDope::new(4, 1), MsgDope::default());
    let recv_string = layout::string(RECV_BUF, 4, 0);
    k.platform_mut().poke_words(SpaceId(2), recv_string, &[0, 0, 128, 0x40_000]);

    run_as(&mut k, b);
    let wait = IpcRequest::open_wait(Timeout::NEVER).with_receive(long_receive(RECV_BUF));
    assert_eq!(k.ipc(wait), Ok(IpcStatus::Blocked));

    run_as(&mut k, a);
    let send = IpcRequest::send(b_id, MessageRegisters::new(1, 2), Timeout::NEVER)
        .with_send(long_send(SEND_BUF));
    assert_eq!(done(k.ipc(send)).error(), Some(IpcError::SendAborted));
    assert_eq!(completion(&mut k, b).error(), Some(IpcError::ReceiveAborted));
    assert_eq!(k.thread(b).unwrap().state(), ThreadState::Ready);
}

#[test]
fn test_buffer_wrapping_address_space_aborts() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);
    let top = u64::MAX & !0xfff;

    write_header(&mut k, 1, SEND_BUF, 0, MsgDope::new(4, 0), MsgDope::new(4, 0));
    // A declared capacity that runs well past the last page.
    write_header(&mut k, 2, top, 0, MsgDope::new(1024, 0), MsgDope::default());

    run_as(&mut k, b);
    let wait = IpcRequest::open_wait(Timeout::NEVER).with_receive(long_receive(top));
    assert_eq!(k.ipc(wait), Ok(IpcStatus::Blocked));

    run_as(&mut k, a);
    let send = IpcRequest::send(b_id, MessageRegisters::new(1, 2), Timeout::NEVER)
        .with_send(long_send(SEND_BUF));
    assert_eq!(done(k.ipc(send)).error(), Some(IpcError::SendAborted));
    assert_eq!(completion(&mut k, b).error(), Some(IpcError::ReceiveAborted));
}

#[test]
fn test_flexpage_without_window_cuts_both_sides() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, b);
    assert_eq!(k.open_wait(Timeout::NEVER), Ok(IpcStatus::Blocked));

    run_as(&mut k, a);
    let fpage = Fpage::memory(0x40_0000, 22, FpageRights::RW);
    let send = IpcRequest::send(b_id, MessageRegisters::new(0, fpage.raw()), Timeout::NEVER)
        .with_send(SendDesc {
            kind: SendKind::RegisterFpage,
            deceite: false,
        });
    assert_eq!(done(k.ipc(send)).error(), Some(IpcError::SendMessageCut));

    let got = completion(&mut k, b);
    assert_eq!(got.error(), Some(IpcError::ReceiveMessageCut));
    assert!(!got.dope.fpage_received());
    assert_eq!(got.regs, MessageRegisters::default());
    assert!(k.platform().mappings.is_empty());
}

#[test]
fn test_flexpage_mapped_into_window() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, b);
    let window = Fpage::memory(0x100_0000, 12, FpageRights::RWX);
    let wait = IpcRequest::open_wait(Timeout::NEVER).with_receive(ReceiveDesc {
        kind: ReceiveKind::RegisterFpage { window },
        open_wait: true,
    });
    assert_eq!(k.ipc(wait), Ok(IpcStatus::Blocked));

    run_as(&mut k, a);
    let fpage = Fpage::memory(0x40_0000, 22, FpageRights::RW);
    let send = IpcRequest::send(b_id, MessageRegisters::new(0x1000, fpage.raw()), Timeout::NEVER)
        .with_send(SendDesc {
            kind: SendKind::RegisterFpage,
            deceite: false,
        });
    assert!(done(k.ipc(send)).is_ok());

    let got = completion(&mut k, b);
    assert!(got.is_ok());
    assert!(got.dope.fpage_received());
    let mapping = k.platform().mappings[0];
    assert_eq!(mapping.from, SpaceId(1));
    assert_eq!(mapping.to, SpaceId(2));
    assert_eq!(mapping.placement.source, 0x40_1000);
    assert_eq!(mapping.placement.dest, 0x100_0000);
    assert_eq!(mapping.placement.order, 12);
    assert!(!mapping.grant);
}

#[test]
fn test_failed_mapping_reports_map_failed() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);
    k.platform_mut().fail_maps = Some(MapError::OutOfMemory);

    run_as(&mut k, b);
    let wait = IpcRequest::open_wait(Timeout::NEVER).with_receive(ReceiveDesc {
        kind: ReceiveKind::RegisterFpage {
            window: Fpage::whole_space(FpageRights::RWX),
        },
        open_wait: true,
    });
    assert_eq!(k.ipc(wait), Ok(IpcStatus::Blocked));

    run_as(&mut k, a);
    let fpage = Fpage::memory(0x40_0000, 12, FpageRights::READ);
    let send = IpcRequest::send(b_id, MessageRegisters::new(0, fpage.raw()), Timeout::NEVER)
        .with_send(SendDesc {
            kind: SendKind::RegisterFpage,
            deceite: false,
        });
    assert_eq!(done(k.ipc(send)).error(), Some(IpcError::SendMapFailed));
    assert_eq!(completion(&mut k, b).error(), Some(IpcError::ReceiveMapFailed));
}

fn paged_out_sender(policy: PagerPolicy, timeout: Timeout) -> (IpcOutcome, IpcOutcome, usize) {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);
    write_header(&mut k, 1, SEND_BUF, 0, MsgDope::new(4, 0), MsgDope::new(4, 0));
    k.platform_mut().poke_words(SpaceId(1), layout::word(SEND_BUF, 2), &[0x55, 0x66]);
    k.platform_mut().page_out(SpaceId(1), SEND_BUF);
    write_header(&mut k, 2, RECV_BUF, 0, MsgDope::new(4, 0), MsgDope::default());
    k.platform_mut().pager_policy = policy;

    run_as(&mut k, b);
    let wait = IpcRequest::open_wait(Timeout::NEVER).with_receive(long_receive(RECV_BUF));
    assert_eq!(k.ipc(wait), Ok(IpcStatus::Blocked));

    run_as(&mut k, a);
    let send = IpcRequest::send(b_id, MessageRegisters::new(1, 2), timeout)
        .with_send(long_send(SEND_BUF));
    let sent = done(k.ipc(send));
    let got = completion(&mut k, b);
    (sent, got, k.platform().faults.len())
}

#[test]
fn test_sender_fault_resolved() {
    let (sent, got, faults) = paged_out_sender(PagerPolicy::Resolve, Timeout::NEVER);
    assert!(sent.is_ok());
    assert!(got.is_ok());
    assert_eq!(got.dope.words(), 4);
    assert_eq!(faults, 1);
}

#[test]
fn test_sender_fault_timeout() {
    let (sent, got, _) = paged_out_sender(PagerPolicy::Timeout, Timeout::NEVER);
    assert_eq!(sent.error(), Some(IpcError::SendSendPfTimeout));
    assert_eq!(got.error(), Some(IpcError::ReceiveSendPfTimeout));
}

#[test]
fn test_zero_pf_timeout_skips_pager() {
    let (sent, got, faults) = paged_out_sender(PagerPolicy::Resolve, Timeout::NEVER.with_pf(0, 15));
    assert_eq!(sent.error(), Some(IpcError::SendSendPfTimeout));
    assert_eq!(got.error(), Some(IpcError::ReceiveSendPfTimeout));
    assert_eq!(faults, 0);
}

#[test]
fn test_rejected_fault_aborts() {
    let (sent, got, _) = paged_out_sender(PagerPolicy::Reject, Timeout::NEVER);
    assert_eq!(sent.error(), Some(IpcError::SendAborted));
    assert_eq!(got.error(), Some(IpcError::ReceiveAborted));
}

#[test]
fn test_receiver_fault_timeout() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);
    write_header(&mut k, 1, SEND_BUF, 0, MsgDope::new(4, 0), MsgDope::new(4, 0));
    k.platform_mut().poke_words(SpaceId(1), layout::word(SEND_BUF, 2), &[0x55, 0x66]);
    // Header at the end of a present page; word 2 starts the next, missing one.
    let far = RECV_BUF + 0x1000 - layout::WORDS - 16;
    write_header(&mut k, 2, far, 0, MsgDope::new(4, 0), MsgDope::default());
    k.platform_mut().pager_policy = PagerPolicy::Timeout;

    run_as(&mut k, b);
    let wait = IpcRequest::open_wait(Timeout::NEVER).with_receive(long_receive(far));
    assert_eq!(k.ipc(wait), Ok(IpcStatus::Blocked));

    run_as(&mut k, a);
    let send = IpcRequest::send(b_id, MessageRegisters::new(1, 2), Timeout::NEVER)
        .with_send(long_send(SEND_BUF));
    assert_eq!(done(k.ipc(send)).error(), Some(IpcError::SendReceivePfTimeout));
    assert_eq!(completion(&mut k, b).error(), Some(IpcError::ReceiveReceivePfTimeout));
}

#[test]
fn test_send_timeout_fires() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, a);
    let timeout = Timeout::NEVER.with_send(TimeoutField::new(100, 0));
    assert_eq!(k.send(b_id, MessageRegisters::default(), timeout), Ok(IpcStatus::Blocked));
    assert_eq!(k.next_deadline(), Some(100));

    k.platform_mut().set_time(99);
    assert_eq!(k.tick(), 0);
    k.platform_mut().set_time(100);
    assert_eq!(k.tick(), 1);

    assert_eq!(completion(&mut k, a).error(), Some(IpcError::SendTimeout));
    assert!(k.thread(b).unwrap().sender_queue().is_empty());
    assert_eq!(k.armed_timeouts(), 0);
}

#[test]
fn test_rendezvous_disarms_timeout() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (b, b_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, a);
    let timeout = Timeout::NEVER.with_send(TimeoutField::new(100, 0));
    assert_eq!(k.send(b_id, MessageRegisters::new(9, 9), timeout), Ok(IpcStatus::Blocked));

    run_as(&mut k, b);
    assert!(done(k.open_wait(Timeout::NEVER)).is_ok());
    assert_eq!(k.armed_timeouts(), 0);

    k.platform_mut().set_time(1_000);
    assert_eq!(k.tick(), 0);
    assert!(completion(&mut k, a).is_ok());
}

#[test]
fn test_receive_from_nil_sleeps() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);

    run_as(&mut k, a);
    let timeout = Timeout::NEVER.with_receive(TimeoutField::new(50, 0));
    assert_eq!(k.receive(ThreadId::NIL, timeout), Ok(IpcStatus::Blocked));
    assert_eq!(k.thread(a).unwrap().state(), ThreadState::ReceiveBlocked { source: Source::Nil });

    k.platform_mut().set_time(50);
    assert_eq!(k.tick(), 1);
    assert_eq!(completion(&mut k, a).error(), Some(IpcError::ReceiveTimeout));
}

#[test]
fn test_zero_timeout_receive_polls() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    run_as(&mut k, a);
    assert_eq!(done(k.open_wait(Timeout::ZERO)).error(), Some(IpcError::ReceiveTimeout));
    assert_eq!(k.thread(a).unwrap().state(), ThreadState::Ready);
}

#[test]
fn test_delete_aborts_queued_senders_and_receivers() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (c, _) = spawn(&mut k, 3, 3);
    let (b, b_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, a);
    assert_eq!(k.send(b_id, MessageRegisters::default(), Timeout::NEVER), Ok(IpcStatus::Blocked));
    run_as(&mut k, c);
    assert_eq!(k.receive(b_id, Timeout::NEVER), Ok(IpcStatus::Blocked));

    run_as(&mut k, a);
    k.delete_thread(b_id).unwrap();

    assert_eq!(completion(&mut k, a).error(), Some(IpcError::SendAborted));
    assert_eq!(completion(&mut k, c).error(), Some(IpcError::ReceiveAborted));
    assert!(k.thread(b).is_none());
    assert!(k.lookup(b_id).is_none());
    assert_eq!(k.thread(a).unwrap().queue(), None);
}

#[test]
fn test_recreated_thread_gets_new_version() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    let (_, old_id) = spawn(&mut k, 2, 2);
    k.delete_thread(old_id).unwrap();
    let (_, new_id) = spawn(&mut k, 2, 2);

    assert_ne!(old_id, new_id);
    assert_eq!(old_id.global_thread(), new_id.global_thread());

    run_as(&mut k, a);
    let outcome = done(k.send(old_id, MessageRegisters::default(), Timeout::NEVER));
    assert_eq!(outcome.error(), Some(IpcError::NotExistent));
}

#[test]
fn test_cancel_blocked_threads() {
    let mut k = kernel();
    let (a, a_id) = spawn(&mut k, 1, 1);
    let (c, c_id) = spawn(&mut k, 3, 3);
    let (b, b_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, a);
    assert_eq!(k.send(b_id, MessageRegisters::default(), Timeout::NEVER), Ok(IpcStatus::Blocked));
    run_as(&mut k, c);
    assert_eq!(k.open_wait(Timeout::NEVER), Ok(IpcStatus::Blocked));

    run_as(&mut k, b);
    assert_eq!(k.cancel(a_id), Ok(true));
    assert_eq!(k.cancel(c_id), Ok(true));
    assert_eq!(k.cancel(b_id), Ok(false));

    assert_eq!(completion(&mut k, a).error(), Some(IpcError::SendCancelled));
    assert_eq!(completion(&mut k, c).error(), Some(IpcError::ReceiveCancelled));
    assert!(k.thread(b).unwrap().sender_queue().is_empty());
    assert_eq!(k.cancel(ThreadId::from_parts(99, 0, 1)), Err(KernelError::UnknownThread));
}

#[test]
fn test_exchange_registers_cancels_and_swaps() {
    let mut k = kernel();
    let (a, a_id) = spawn(&mut k, 1, 1);
    let (_, b_id) = spawn(&mut k, 2, 2);

    run_as(&mut k, a);
    assert_eq!(k.send(b_id, MessageRegisters::default(), Timeout::NEVER), Ok(IpcStatus::Blocked));

    let old = k.exchange_registers(a_id, Some(0x4000), Some(0x8000)).unwrap();
    assert_eq!((old.ip, old.sp), (0, 0));
    let now = k.thread(a).unwrap().user_registers();
    assert_eq!((now.ip, now.sp), (0x4000, 0x8000));
    assert_eq!(completion(&mut k, a).error(), Some(IpcError::SendCancelled));
}

#[test]
fn test_priority_change_requeues_sender() {
    let mut k = kernel();
    let senders: Vec<_> = (1..=3).map(|task| spawn(&mut k, task, task)).collect();
    let (b, b_id) = spawn(&mut k, 9, 9);

    for (handle, _) in &senders {
        run_as(&mut k, *handle);
        assert_eq!(
            k.send(b_id, MessageRegisters::default(), Timeout::NEVER),
            Ok(IpcStatus::Blocked)
        );
    }
    k.set_priority(senders[2].1, 0x80).unwrap();

    let order = k.thread(b).unwrap().sender_queue().to_vec(k.threads());
    assert_eq!(order, vec![senders[2].0, senders[0].0, senders[1].0]);
}

#[test]
fn test_wait_next_period() {
    let mut k = kernel();
    let (a, _) = spawn(&mut k, 1, 1);
    run_as(&mut k, a);

    assert_eq!(k.wait_next_period(500), Ok(IpcStatus::Blocked));
    assert_eq!(k.thread(a).unwrap().state(), ThreadState::PeriodicWait);
    k.platform_mut().set_time(500);
    assert_eq!(k.tick(), 1);
    assert!(completion(&mut k, a).is_ok());

    assert!(matches!(k.wait_next_period(100), Ok(IpcStatus::Done(_))));
}

#[test]
fn test_deceit_honored_inside_task() {
    let mut k = kernel();
    let a = k.create_thread(ThreadParams::new(4, 1, SpaceId(1))).unwrap();
    let b = k.create_thread(ThreadParams::new(4, 2, SpaceId(2))).unwrap();
    let b_id = k.thread_id(b).unwrap();
    let claimed = ThreadId::from_parts(4, 9, 1);

    run_as(&mut k, b);
    assert_eq!(k.open_wait(Timeout::NEVER), Ok(IpcStatus::Blocked));

    run_as(&mut k, a);
    let send = IpcRequest::send(b_id, MessageRegisters::default(), Timeout::NEVER)
        .with_send(SendDesc {
            kind: SendKind::Registers,
            deceite: true,
        })
        .deceiving(claimed);
    assert!(done(k.ipc(send)).is_ok());

    let got = completion(&mut k, b);
    assert_eq!(got.sender, Some(claimed));
    assert!(got.dope.deceited());
    assert!(got.dope.src_inside());
}

#[test]
fn test_no_current_thread() {
    let mut k = kernel();
    assert_eq!(k.open_wait(Timeout::NEVER), Err(KernelError::NoCurrentThread));
}
