//! Kernel configuration.

use bitflags::bitflags;
use rendezvous_hal::TraceKind;

/// Default thread-table capacity.
pub const DEFAULT_MAX_THREADS: usize = 256;

/// Default number of records the trace ring holds.
pub const DEFAULT_TRACE_CAPACITY: usize = 512;

/// Default retries of one user access after successful fault resolution.
pub const DEFAULT_FAULT_RETRIES: u32 = 8;

/// Default priority of new threads.
pub const DEFAULT_PRIORITY: u8 = 0x10;

bitflags! {
    /// Which trace record kinds are emitted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TraceMask: u8 {
        const IPC = 1 << 0;
        const TIMEOUT = 1 << 1;
        const SEMAPHORE = 1 << 2;
        const LIFECYCLE = 1 << 3;
        const LOCAL_IPC = 1 << 4;
    }
}

impl TraceMask {
    /// True if records of `kind` pass this mask.
    pub fn covers(&self, kind: TraceKind) -> bool {
        let class = match kind {
            TraceKind::Rendezvous
            | TraceKind::Block
            | TraceKind::Wakeup
            | TraceKind::Cancel
            | TraceKind::Abort => TraceMask::IPC,
            TraceKind::Timeout => TraceMask::TIMEOUT,
            TraceKind::SemaphoreDown | TraceKind::SemaphoreUp => TraceMask::SEMAPHORE,
            TraceKind::ThreadCreate | TraceKind::ThreadDelete => TraceMask::LIFECYCLE,
            TraceKind::LocalIpc => TraceMask::LOCAL_IPC,
        };
        self.contains(class)
    }
}

/// Kernel-wide settings, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Maximum number of live threads.
    pub max_threads: usize,
    /// Capacity of the trace ring; zero disables tracing.
    pub trace_capacity: usize,
    /// Record kinds to trace.
    pub trace_mask: TraceMask,
    /// Whether same-space IPC may take the fast path.
    pub local_ipc: bool,
    /// How often a single user access is retried after the pager reported
    /// success before it counts as a page-fault timeout.
    pub fault_retries: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            trace_mask: TraceMask::all(),
            local_ipc: true,
            fault_retries: DEFAULT_FAULT_RETRIES,
        }
    }
}

impl KernelConfig {
    /// Sets the thread-table capacity.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Sets trace ring capacity and mask.
    pub fn with_trace(mut self, capacity: usize, mask: TraceMask) -> Self {
        self.trace_capacity = capacity;
        self.trace_mask = mask;
        self
    }

    /// Enables or disables the local-IPC fast path.
    pub fn with_local_ipc(mut self, enabled: bool) -> Self {
        self.local_ipc = enabled;
        self
    }
}
