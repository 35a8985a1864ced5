//! Rendezvous collaborator traits.
//!
//! The IPC core never schedules, resolves faults, edits page tables or
//! reads a clock by itself. It reaches those services through the traits in
//! this crate, implemented by the embedding platform.

#![no_std]

use core::fmt;

use rendezvous_common::{ContextRef, Fpage, IpcError, MapPlacement, SpaceId};

/// Kind of a faulting user-memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
}

/// A user-memory access hit a page that is not accessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub space: SpaceId,
    pub address: u64,
    pub access: Access,
}

/// Reasons a page fault stays unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultError {
    /// Pager did not answer before the page-fault timeout
    Timeout,
    /// Pager refused to provide the page
    Rejected,
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::Timeout => write!(f, "page fault resolution timed out"),
            FaultError::Rejected => write!(f, "pager rejected the page fault"),
        }
    }
}

/// Reasons a flexpage could not be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapError {
    /// Sender does not own the source region
    NotMapped,
    /// Out of page-table memory in the receiving space
    OutOfMemory,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::NotMapped => write!(f, "source region not mapped"),
            MapError::OutOfMemory => write!(f, "out of mapping memory"),
        }
    }
}

/// A flexpage transfer to carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub from: SpaceId,
    pub to: SpaceId,
    pub fpage: Fpage,
    pub placement: MapPlacement,
    /// Remove the region from the sender instead of sharing it.
    pub grant: bool,
}

/// How a thread made ready by another thread's operation gets the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// Run it right away in place of the releasing thread.
    SwitchTo,
    /// Put it on the ready set.
    Enqueue,
}

/// Trait for the scheduler the state machine hands threads to.
pub trait Scheduler {
    /// Returns the thread executing the current system call.
    fn current(&self) -> ContextRef;
    /// Adds a thread to the ready set.
    fn enqueue_ready(&mut self, thread: ContextRef, priority: u8);
    /// Makes `thread` the running thread immediately.
    fn switch_to(&mut self, thread: ContextRef);
    /// Notes that a thread blocked and left the ready set.
    fn dequeue(&mut self, _thread: ContextRef) {}
    /// Decides how a woken thread is released. The default hands the CPU
    /// over only when the releasing thread is about to block.
    fn handoff(&self, _woken: ContextRef, releaser_continues: bool) -> Handoff {
        if releaser_continues {
            Handoff::Enqueue
        } else {
            Handoff::SwitchTo
        }
    }
}

/// Trait for the external pager protocol.
pub trait Pager {
    /// Makes `address` in `space` accessible for `access`, or explains why not.
    fn resolve_page_fault(
        &mut self,
        space: SpaceId,
        address: u64,
        access: Access,
    ) -> Result<(), FaultError>;
}

/// Trait for the page-table layer that establishes flexpage mappings.
pub trait Mapper {
    /// Maps (or grants) a region from one space into another.
    fn map(&mut self, request: &MapRequest) -> Result<(), MapError>;
}

/// Trait for faulting access to user memory.
pub trait UserMemory {
    /// Reads one little-endian message word.
    fn read_word(&self, space: SpaceId, address: u64) -> Result<u64, PageFault>;
    /// Writes one little-endian message word.
    fn write_word(&mut self, space: SpaceId, address: u64, value: u64) -> Result<(), PageFault>;
    /// Fills `buf` from user memory.
    fn read_bytes(&self, space: SpaceId, address: u64, buf: &mut [u8]) -> Result<(), PageFault>;
    /// Copies `buf` into user memory.
    fn write_bytes(&mut self, space: SpaceId, address: u64, buf: &[u8]) -> Result<(), PageFault>;
}

/// Trait for the monotonic system clock.
pub trait Clock {
    /// Returns microseconds since the system started.
    fn current_micros(&self) -> u64;
}

/// Kind of a structured trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    Rendezvous,
    Block,
    Wakeup,
    Timeout,
    Cancel,
    Abort,
    LocalIpc,
    SemaphoreDown,
    SemaphoreUp,
    ThreadCreate,
    ThreadDelete,
}

/// One structured trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub kind: TraceKind,
    pub actor: ContextRef,
    pub partner: Option<ContextRef>,
    pub outcome: Option<IpcError>,
    pub timestamp: u64,
}

/// Trait for a best-effort trace consumer.
pub trait TraceSink {
    /// Offers a record; returns `false` if it was dropped. Never blocks.
    fn record(&self, record: TraceRecord) -> bool;
}

/// Everything the kernel needs from its platform.
pub trait Platform: Scheduler + Pager + Mapper + UserMemory + Clock {}

impl<T: Scheduler + Pager + Mapper + UserMemory + Clock> Platform for T {}
