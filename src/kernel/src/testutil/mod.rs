//! Simulated platform for exercising the kernel on the host.
//!
//! [`SimPlatform`] implements every collaborator trait in memory: a
//! [`BandScheduler`], paged user memory that faults on missing pages, a
//! scriptable pager, a recording mapper and a manual clock.
//!
//! # Usage
//!
//! ```rust,ignore
//! use rendezvous_kernel::testutil::SimPlatform;
//!
//! let mut kernel = Kernel::new(SimPlatform::new(), KernelConfig::default());
//! let a = kernel.create_thread(ThreadParams::new(1, 0, SpaceId(1)))?;
//! kernel.platform_mut().set_current(a);
//! ```

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use rendezvous_common::{ContextRef, SpaceId};
use rendezvous_hal::{
    Access, Clock, FaultError, MapError, MapRequest, Mapper, PageFault, Pager, Scheduler,
    UserMemory,
};

use crate::sched::BandScheduler;

/// Page size of simulated user memory.
pub const PAGE_SIZE: u64 = 4096;

/// How the simulated pager answers faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerPolicy {
    /// Page the memory in (zero-filled if it never existed).
    Resolve,
    /// Never answer in time.
    Timeout,
    /// Refuse.
    Reject,
}

/// In-memory implementation of all platform traits.
pub struct SimPlatform {
    /// Ready queues and current thread.
    pub scheduler: BandScheduler,
    pages: BTreeMap<(SpaceId, u64), Vec<u8>>,
    paged_out: BTreeMap<(SpaceId, u64), Vec<u8>>,
    /// Answer to the next page faults.
    pub pager_policy: PagerPolicy,
    /// Clock advance per resolved fault, in microseconds.
    pub fault_latency: u64,
    /// Every fault the pager was asked about.
    pub faults: Vec<PageFault>,
    /// Every mapping established.
    pub mappings: Vec<MapRequest>,
    /// Makes every mapping attempt fail with this error.
    pub fail_maps: Option<MapError>,
    clock: u64,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    /// Create a platform with empty memory at time zero.
    pub fn new() -> Self {
        Self {
            scheduler: BandScheduler::default(),
            pages: BTreeMap::new(),
            paged_out: BTreeMap::new(),
            pager_policy: PagerPolicy::Resolve,
            fault_latency: 0,
            faults: Vec::new(),
            mappings: Vec::new(),
            fail_maps: None,
            clock: 0,
        }
    }

    /// Makes `thread` the caller of the next kernel entry.
    pub fn set_current(&mut self, thread: ContextRef) {
        self.scheduler.set_current(thread);
    }

    /// Sets the clock.
    pub fn set_time(&mut self, micros: u64) {
        self.clock = micros;
    }

    /// Moves the clock forward.
    pub fn advance(&mut self, micros: u64) {
        self.clock += micros;
    }

    /// Makes the page holding `address` present.
    pub fn map_page(&mut self, space: SpaceId, address: u64) {
        self.pages
            .entry((space, page_of(address)))
            .or_insert_with(|| vec![0; PAGE_SIZE as usize]);
    }

    /// Pages out the page holding `address`; the next access faults and a
    /// resolving pager brings the old contents back.
    pub fn page_out(&mut self, space: SpaceId, address: u64) {
        let key = (space, page_of(address));
        if let Some(page) = self.pages.remove(&key) {
            self.paged_out.insert(key, page);
        }
    }

    /// Writes words directly, mapping pages as needed.
    pub fn poke_words(&mut self, space: SpaceId, address: u64, words: &[u64]) {
        for (i, word) in words.iter().enumerate() {
            self.poke_bytes(space, address + 8 * i as u64, &word.to_le_bytes());
        }
    }

    /// Writes bytes directly, mapping pages as needed.
    pub fn poke_bytes(&mut self, space: SpaceId, address: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let at = address + i as u64;
            self.map_page(space, at);
            if let Some(page) = self.pages.get_mut(&(space, page_of(at))) {
                page[(at - page_of(at)) as usize] = *byte;
            }
        }
    }

    /// Reads a word directly, if its pages are present.
    pub fn peek_word(&self, space: SpaceId, address: u64) -> Option<u64> {
        let bytes = self.peek_bytes(space, address, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Some(u64::from_le_bytes(word))
    }

    /// Reads bytes directly, if their pages are present.
    pub fn peek_bytes(&self, space: SpaceId, address: u64, len: usize) -> Option<Vec<u8>> {
        let mut out = vec![0; len];
        self.read_bytes(space, address, &mut out).ok()?;
        Some(out)
    }
}

fn page_of(address: u64) -> u64 {
    address & !(PAGE_SIZE - 1)
}

impl Scheduler for SimPlatform {
    fn current(&self) -> ContextRef {
        self.scheduler.current()
    }

    fn enqueue_ready(&mut self, thread: ContextRef, priority: u8) {
        self.scheduler.enqueue_ready(thread, priority);
    }

    fn switch_to(&mut self, thread: ContextRef) {
        self.scheduler.switch_to(thread);
    }

    fn dequeue(&mut self, thread: ContextRef) {
        self.scheduler.dequeue(thread);
    }
}

impl Pager for SimPlatform {
    fn resolve_page_fault(
        &mut self,
        space: SpaceId,
        address: u64,
        access: Access,
    ) -> Result<(), FaultError> {
        self.faults.push(PageFault { space, address, access });
        match self.pager_policy {
            PagerPolicy::Resolve => {
                self.clock += self.fault_latency;
                let key = (space, page_of(address));
                let page = self
                    .paged_out
                    .remove(&key)
                    .unwrap_or_else(|| vec![0; PAGE_SIZE as usize]);
                self.pages.entry(key).or_insert(page);
                Ok(())
            }
            PagerPolicy::Timeout => Err(FaultError::Timeout),
            PagerPolicy::Reject => Err(FaultError::Rejected),
        }
    }
}

impl Mapper for SimPlatform {
    fn map(&mut self, request: &MapRequest) -> Result<(), MapError> {
        if let Some(err) = self.fail_maps {
            return Err(err);
        }
        self.mappings.push(*request);
        Ok(())
    }
}

impl UserMemory for SimPlatform {
    fn read_word(&self, space: SpaceId, address: u64) -> Result<u64, PageFault> {
        let mut word = [0u8; 8];
        self.read_bytes(space, address, &mut word)?;
        Ok(u64::from_le_bytes(word))
    }

    fn write_word(&mut self, space: SpaceId, address: u64, value: u64) -> Result<(), PageFault> {
        self.write_bytes(space, address, &value.to_le_bytes())
    }

    fn read_bytes(&self, space: SpaceId, address: u64, buf: &mut [u8]) -> Result<(), PageFault> {
        let mut done = 0;
        while done < buf.len() {
            let at = address + done as u64;
            let offset = (at - page_of(at)) as usize;
            let n = (buf.len() - done).min(PAGE_SIZE as usize - offset);
            let Some(page) = self.pages.get(&(space, page_of(at))) else {
                return Err(PageFault {
                    space,
                    address: at,
                    access: Access::Read,
                });
            };
            buf[done..done + n].copy_from_slice(&page[offset..offset + n]);
            done += n;
        }
        Ok(())
    }

    fn write_bytes(&mut self, space: SpaceId, address: u64, buf: &[u8]) -> Result<(), PageFault> {
        let mut done = 0;
        while done < buf.len() {
            let at = address + done as u64;
            let offset = (at - page_of(at)) as usize;
            let n = (buf.len() - done).min(PAGE_SIZE as usize - offset);
            let Some(page) = self.pages.get_mut(&(space, page_of(at))) else {
                return Err(PageFault {
                    space,
                    address: at,
                    access: Access::Write,
                });
            };
            page[offset..offset + n].copy_from_slice(&buf[done..done + n]);
            done += n;
        }
        Ok(())
    }
}

impl Clock for SimPlatform {
    fn current_micros(&self) -> u64 {
        self.clock
    }
}
