//! Rendezvous Kernel
//!
//! The IPC core of an L4-style microkernel: synchronous message passing
//! between threads, the block/wakeup state machine behind it, and a user
//! semaphore built on the same wait queues.
//!
//! # Architecture
//!
//! The kernel is structured into the following modules:
//! - `thread`: thread arena, protocol states, lifecycle and timeouts
//! - `wait_queue`: priority-ordered queues with links stored in the threads
//! - `ipc`: rendezvous, message transfer and the local-IPC fast path
//! - `sync`: user semaphores
//! - `syscall`: system-call decoding and dispatch
//!
//! Scheduling, page-fault resolution, page-table updates, user-memory
//! access and the clock come from the platform through the traits in
//! `rendezvous_hal`. [`testutil::SimPlatform`] implements them in memory.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod ipc;
mod kernel;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod testutil;
pub mod thread;
pub mod timeout;
pub mod trace;
pub mod wait_queue;

pub use config::KernelConfig;
pub use error::KernelError;
pub use ipc::lipc::{Checkpoint, NoPreemption, PreemptAt, Preemption, Recovery};
pub use ipc::message::{IpcOutcome, IpcRequest, IpcStatus, MessageRegisters};
pub use kernel::{Kernel, SharedKernel};
pub use sync::{SemOutcome, SemStatus, SemaphoreId, SemaphoreShared};
pub use syscall::{IpcFrame, Syscall, SyscallResult};
pub use thread::{Completion, Source, ThreadParams, ThreadState};
