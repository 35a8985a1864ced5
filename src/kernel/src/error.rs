//! Kernel-object errors.
//!
//! IPC outcomes are not errors in this sense; they travel as
//! [`MsgDope`](rendezvous_common::MsgDope) values. `KernelError` covers
//! misuse of the management interface and detected invariant violations.

use core::fmt;

/// Errors returned by kernel management operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KernelError {
    /// Thread table is full
    NoFreeSlot,
    /// Handle refers to a deleted thread
    StaleHandle,
    /// Identifier does not name a live thread
    UnknownThread,
    /// (task, local thread) pair is already in use
    IdentifierInUse,
    /// Task or local thread number does not fit an identifier
    IdentifierOutOfRange,
    /// Semaphore handle does not exist
    UnknownSemaphore,
    /// Scheduler's current thread is not a live thread
    NoCurrentThread,
    /// No interrupted fast-path operation to resume
    NothingToResume,
    /// Internal consistency check failed
    InvariantViolation,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NoFreeSlot => write!(f, "thread table full"),
            KernelError::StaleHandle => write!(f, "stale thread handle"),
            KernelError::UnknownThread => write!(f, "no such thread"),
            KernelError::IdentifierInUse => write!(f, "thread identifier in use"),
            KernelError::IdentifierOutOfRange => {
                write!(f, "task or local thread number out of range")
            }
            KernelError::UnknownSemaphore => write!(f, "no such semaphore"),
            KernelError::NoCurrentThread => write!(f, "no current thread"),
            KernelError::NothingToResume => write!(f, "no interrupted IPC to resume"),
            KernelError::InvariantViolation => write!(f, "kernel invariant violated"),
        }
    }
}

/// Reports a broken kernel invariant and evaluates to
/// [`KernelError::InvariantViolation`].
///
/// Debug builds halt on the spot.
macro_rules! invariant_violation {
    ($($arg:tt)*) => {{
        log::error!("invariant violation: {}", format_args!($($arg)*));
        debug_assert!(false, $($arg)*);
        $crate::error::KernelError::InvariantViolation
    }};
}

pub(crate) use invariant_violation;
