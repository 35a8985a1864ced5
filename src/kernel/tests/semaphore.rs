//! User semaphore behavior through the kernel entry points.

use std::sync::atomic::{AtomicUsize, Ordering};

use rendezvous_common::{ContextRef, SpaceId, Timeout, TimeoutField};
use rendezvous_kernel::testutil::SimPlatform;
use rendezvous_kernel::{
    Completion, Kernel, KernelConfig, KernelError, SemOutcome, SemStatus, SharedKernel, Source,
    ThreadParams,
    ThreadState,
};

fn kernel() -> Kernel<SimPlatform> {
    Kernel::new(SimPlatform::new(), KernelConfig::default())
}

fn spawn(k: &mut Kernel<SimPlatform>, lthread: u32, priority: u8) -> ContextRef {
    k.create_thread(ThreadParams::new(1, lthread, SpaceId(1)).with_priority(priority))
        .unwrap()
}

fn sem_completion(k: &mut Kernel<SimPlatform>, thread: ContextRef) -> Option<SemOutcome> {
    match k.take_completion(thread) {
        Some(Completion::Semaphore(outcome)) => Some(outcome),
        Some(other) => panic!("unexpected completion {:?}", other),
        None => None,
    }
}

#[test]
fn test_down_with_units_does_not_block() {
    let mut k = kernel();
    let a = spawn(&mut k, 0, 0x10);
    let sem = k.semaphore_create(2);
    k.platform_mut().set_current(a);

    assert_eq!(k.semaphore_down(sem, Timeout::NEVER), Ok(SemStatus::Done(SemOutcome::Ok)));
    assert_eq!(k.semaphore_down(sem, Timeout::NEVER), Ok(SemStatus::Done(SemOutcome::Ok)));
    assert_eq!(k.semaphore_shared(sem).unwrap().count(), 0);
    assert_eq!(k.semaphore_down(sem, Timeout::ZERO), Ok(SemStatus::Done(SemOutcome::Timeout)));
    assert_eq!(k.semaphore_shared(sem).unwrap().count(), 0);
    assert!(!k.semaphore_shared(sem).unwrap().is_queued());
}

#[test]
fn test_waiters_released_by_priority() {
    let mut k = kernel();
    let sem = k.semaphore_create(0);
    let waiters: Vec<ContextRef> = [3u8, 1, 3, 2]
        .iter()
        .enumerate()
        .map(|(i, &prio)| spawn(&mut k, i as u32, prio))
        .collect();
    let poster = spawn(&mut k, 10, 0x40);

    for &waiter in &waiters {
        k.platform_mut().set_current(waiter);
        assert_eq!(k.semaphore_down(sem, Timeout::NEVER), Ok(SemStatus::Blocked));
        assert_eq!(
            k.thread(waiter).unwrap().state(),
            ThreadState::ReceiveBlocked {
                source: Source::Semaphore(sem)
            }
        );
    }
    assert_eq!(k.semaphore_shared(sem).unwrap().count(), -4);

    k.platform_mut().set_current(poster);
    let mut order = Vec::new();
    for _ in 0..waiters.len() {
        assert_eq!(k.semaphore_up(sem), Ok(SemStatus::Done(SemOutcome::Ok)));
        for &waiter in &waiters {
            if let Some(outcome) = sem_completion(&mut k, waiter) {
                assert_eq!(outcome, SemOutcome::Ok);
                order.push(waiter);
            }
        }
    }
    assert_eq!(order, vec![waiters[0], waiters[2], waiters[3], waiters[1]]);
    assert_eq!(k.semaphore_shared(sem).unwrap().count(), 0);
}

#[test]
fn test_timeout_before_up() {
    let mut k = kernel();
    let waiter = spawn(&mut k, 0, 0x10);
    let poster = spawn(&mut k, 1, 0x10);
    let sem = k.semaphore_create(0);

    k.platform_mut().set_current(waiter);
    let timeout = Timeout::NEVER.with_receive(TimeoutField::new(100, 0));
    assert_eq!(k.semaphore_down(sem, timeout), Ok(SemStatus::Blocked));

    k.platform_mut().set_current(poster);
    k.platform_mut().set_time(100);
    assert_eq!(k.tick(), 1);
    assert_eq!(k.semaphore_up(sem), Ok(SemStatus::Done(SemOutcome::Ok)));

    assert_eq!(sem_completion(&mut k, waiter), Some(SemOutcome::Timeout));
    assert_eq!(k.semaphore_shared(sem).unwrap().count(), 1);
}

#[test]
fn test_up_before_timeout() {
    let mut k = kernel();
    let waiter = spawn(&mut k, 0, 0x10);
    let poster = spawn(&mut k, 1, 0x10);
    let sem = k.semaphore_create(0);

    k.platform_mut().set_current(waiter);
    let timeout = Timeout::NEVER.with_receive(TimeoutField::new(100, 0));
    assert_eq!(k.semaphore_down(sem, timeout), Ok(SemStatus::Blocked));

    k.platform_mut().set_current(poster);
    assert_eq!(k.semaphore_up(sem), Ok(SemStatus::Done(SemOutcome::Ok)));
    k.platform_mut().set_time(100);
    assert_eq!(k.tick(), 0);

    assert_eq!(sem_completion(&mut k, waiter), Some(SemOutcome::Ok));
    assert_eq!(k.semaphore_shared(sem).unwrap().count(), 0);
}

#[test]
fn test_cancelled_waiter_returns_unit() {
    let mut k = kernel();
    let waiter = spawn(&mut k, 0, 0x10);
    let other = spawn(&mut k, 1, 0x10);
    let sem = k.semaphore_create(0);

    k.platform_mut().set_current(waiter);
    assert_eq!(k.semaphore_down(sem, Timeout::NEVER), Ok(SemStatus::Blocked));
    assert_eq!(k.semaphore_shared(sem).unwrap().count(), -1);

    k.platform_mut().set_current(other);
    let waiter_id = k.thread_id(waiter).unwrap();
    assert_eq!(k.cancel(waiter_id), Ok(true));
    assert_eq!(sem_completion(&mut k, waiter), Some(SemOutcome::Cancelled));
    assert_eq!(k.semaphore_shared(sem).unwrap().count(), 0);
    assert!(!k.semaphore_shared(sem).unwrap().is_queued());
}

#[test]
fn test_deleted_waiter_returns_unit() {
    let mut k = kernel();
    let waiter = spawn(&mut k, 0, 0x10);
    let other = spawn(&mut k, 1, 0x10);
    let sem = k.semaphore_create(0);

    k.platform_mut().set_current(waiter);
    assert_eq!(k.semaphore_down(sem, Timeout::NEVER), Ok(SemStatus::Blocked));

    k.platform_mut().set_current(other);
    let waiter_id = k.thread_id(waiter).unwrap();
    k.delete_thread(waiter_id).unwrap();
    let shared = k.semaphore_shared(sem).unwrap();
    assert_eq!(shared.count(), 0);
    assert!(!shared.is_queued());

    // The next up is not swallowed by the dead waiter.
    assert_eq!(k.semaphore_up(sem), Ok(SemStatus::Done(SemOutcome::Ok)));
    assert_eq!(k.semaphore_shared(sem).unwrap().count(), 1);
}

#[test]
fn test_destroy_evicts_waiters() {
    let mut k = kernel();
    let a = spawn(&mut k, 0, 0x10);
    let b = spawn(&mut k, 1, 0x10);
    let sem = k.semaphore_create(0);

    for t in [a, b] {
        k.platform_mut().set_current(t);
        assert_eq!(k.semaphore_down(sem, Timeout::NEVER), Ok(SemStatus::Blocked));
    }
    assert_eq!(k.semaphore_destroy(sem), Ok(2));
    assert_eq!(sem_completion(&mut k, a), Some(SemOutcome::Invalid));
    assert_eq!(sem_completion(&mut k, b), Some(SemOutcome::Invalid));
    assert!(k.semaphore_shared(sem).is_none());

    k.platform_mut().set_current(a);
    assert_eq!(k.semaphore_down(sem, Timeout::NEVER), Err(KernelError::UnknownSemaphore));
    assert_eq!(k.semaphore_up(sem), Err(KernelError::UnknownSemaphore));
}

#[test]
fn test_fast_path_defers_to_kernel_when_queued() {
    let mut k = kernel();
    let waiter = spawn(&mut k, 0, 0x10);
    let sem = k.semaphore_create(0);
    let shared = k.semaphore_shared(sem).unwrap();

    k.platform_mut().set_current(waiter);
    assert_eq!(k.semaphore_down(sem, Timeout::NEVER), Ok(SemStatus::Blocked));
    assert!(shared.is_queued());
    assert!(!shared.try_up());
    assert!(!shared.try_down());
}

#[test]
fn test_mutual_exclusion_across_cpus() {
    const CPUS: u32 = 4;
    const ROUNDS: usize = 200;

    let mut k = kernel();
    let threads: Vec<ContextRef> = (0..CPUS).map(|i| spawn(&mut k, i, 0x10)).collect();
    let sem = k.semaphore_create(1);
    let shared_sem = k.semaphore_shared(sem).unwrap();
    let kernel = SharedKernel::new(k);
    let inside = AtomicUsize::new(0);
    let entries = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for &me in &threads {
            let (kernel, shared_sem, inside, entries) = (&kernel, &shared_sem, &inside, &entries);
            scope.spawn(move || {
                for _ in 0..ROUNDS {
                    if !shared_sem.try_down() {
                        let status = kernel.with(|k| {
                            k.platform_mut().set_current(me);
                            k.semaphore_down(sem, Timeout::NEVER)
                        });
                        if status == Ok(SemStatus::Blocked) {
                            loop {
                                let done = kernel.with(|k| k.take_completion(me));
                                match done {
                                    Some(Completion::Semaphore(outcome)) => {
                                        assert_eq!(outcome, SemOutcome::Ok);
                                        break;
                                    }
                                    Some(other) => panic!("unexpected completion {:?}", other),
                                    None => std::thread::yield_now(),
                                }
                            }
                        } else {
                            assert_eq!(status, Ok(SemStatus::Done(SemOutcome::Ok)));
                        }
                    }

                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two holders at once");
                    entries.fetch_add(1, Ordering::Relaxed);
                    inside.fetch_sub(1, Ordering::SeqCst);

                    if !shared_sem.try_up() {
                        let status = kernel.with(|k| {
                            k.platform_mut().set_current(me);
                            k.semaphore_up(sem)
                        });
                        assert_eq!(status, Ok(SemStatus::Done(SemOutcome::Ok)));
                    }
                }
            });
        }
    });

    assert_eq!(entries.load(Ordering::Relaxed), CPUS as usize * ROUNDS);
    assert_eq!(shared_sem.count(), 1);
    let k = kernel.into_inner();
    for t in threads {
        assert_eq!(k.thread(t).unwrap().state(), ThreadState::Ready);
    }
}
