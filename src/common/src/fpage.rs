//! Flexpages: power-of-two regions of memory or I/O-port space.
//!
//! Raw layout (64 bits):
//!
//! ```text
//!  63            12 11 10  9      4 3     0
//! +----------------+--+--+---------+-------+
//! | base / port    |  |io| order   | rights|
//! +----------------+--+--+---------+-------+
//! ```
//!
//! Memory bases are page granular and aligned to the region size. An order
//! of [`WHOLE_SPACE_ORDER`] with a zero base denotes the whole address space.

use bitflags::bitflags;

/// Order value used by the whole-space sentinel.
pub const WHOLE_SPACE_ORDER: u8 = 1;
/// Smallest order of a regular memory flexpage.
pub const PAGE_ORDER: u8 = 12;
/// Largest order of an I/O flexpage (64K ports).
pub const MAX_IO_ORDER: u8 = 16;

const RIGHTS_MASK: u64 = 0xf;
const ORDER_SHIFT: u32 = 4;
const ORDER_MASK: u64 = 0x3f;
const IO_BIT: u64 = 1 << 10;
const BASE_SHIFT: u32 = 12;
const PAGE_MASK: u64 = (1 << PAGE_ORDER) - 1;

bitflags! {
    /// Access rights carried by a flexpage.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct FpageRights: u8 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
        /// Move the region instead of sharing it.
        const GRANT = 1 << 3;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RWX = Self::RW.bits() | Self::EXECUTE.bits();
    }
}

/// Which space a flexpage addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FpageSpace {
    Memory,
    Io,
}

/// A packed flexpage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Fpage(u64);

/// Where a send flexpage lands inside a receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapPlacement {
    /// Start of the mapped part in the sender's space.
    pub source: u64,
    /// Start of the mapped part in the receiver's space.
    pub dest: u64,
    /// log2 of the mapped extent.
    pub order: u8,
}

fn low_mask(order: u32) -> u64 {
    if order >= 64 {
        u64::MAX
    } else {
        (1u64 << order) - 1
    }
}

impl Fpage {
    /// The empty flexpage.
    pub const NIL: Fpage = Fpage(0);

    pub const fn from_raw(raw: u64) -> Self {
        Fpage(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// A memory flexpage. The base is truncated to the region's alignment.
    pub fn memory(base: u64, order: u8, rights: FpageRights) -> Self {
        let order = order.min(ORDER_MASK as u8);
        let base = base & !low_mask(order as u32) & !PAGE_MASK;
        Fpage(base | (order as u64) << ORDER_SHIFT | rights.bits() as u64 & RIGHTS_MASK)
    }

    /// An I/O-port flexpage.
    pub fn io(port: u16, order: u8, rights: FpageRights) -> Self {
        let order = order.min(MAX_IO_ORDER);
        let port = port as u64 & !low_mask(order as u32);
        Fpage(
            port << BASE_SHIFT
                | IO_BIT
                | (order as u64) << ORDER_SHIFT
                | rights.bits() as u64 & RIGHTS_MASK,
        )
    }

    /// The whole-address-space sentinel.
    pub fn whole_space(rights: FpageRights) -> Self {
        Fpage((WHOLE_SPACE_ORDER as u64) << ORDER_SHIFT | rights.bits() as u64 & RIGHTS_MASK)
    }

    pub fn rights(&self) -> FpageRights {
        FpageRights::from_bits_truncate((self.0 & RIGHTS_MASK) as u8)
    }

    /// log2 of the extent as stored.
    pub const fn order(&self) -> u8 {
        ((self.0 >> ORDER_SHIFT) & ORDER_MASK) as u8
    }

    pub const fn space(&self) -> FpageSpace {
        if self.0 & IO_BIT != 0 {
            FpageSpace::Io
        } else {
            FpageSpace::Memory
        }
    }

    /// Base address, or the first port for I/O flexpages.
    pub const fn base(&self) -> u64 {
        match self.space() {
            FpageSpace::Memory => self.0 & !PAGE_MASK,
            FpageSpace::Io => (self.0 >> BASE_SHIFT) & 0xffff,
        }
    }

    pub const fn is_whole_space(&self) -> bool {
        self.order() == WHOLE_SPACE_ORDER && self.base() == 0
    }

    /// Effective log2 extent; the whole space counts as 64.
    pub const fn extent_order(&self) -> u32 {
        if self.is_whole_space() {
            64
        } else {
            self.order() as u32
        }
    }

    /// Structurally well formed: non-empty, a legal order, an aligned base.
    pub fn is_valid(&self) -> bool {
        if self.0 == 0 {
            return false;
        }
        if self.is_whole_space() {
            return true;
        }
        let order = self.order();
        match self.space() {
            FpageSpace::Memory => order >= PAGE_ORDER && self.base() & low_mask(order as u32) == 0,
            FpageSpace::Io => order <= MAX_IO_ORDER && self.base() & low_mask(order as u32) == 0,
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        let mask = low_mask(self.extent_order());
        addr & !mask == self.base() & !mask
    }

    /// Places this (send) flexpage into a receive `window`.
    ///
    /// The larger of the two regions is narrowed around `hot_spot` to the
    /// size of the smaller one, as in the classic L4 map rule. Returns `None`
    /// if either side is invalid or they address different spaces.
    pub fn fit_into(&self, window: &Fpage, hot_spot: u64) -> Option<MapPlacement> {
        if !self.is_valid() || !window.is_valid() || self.space() != window.space() {
            return None;
        }
        let send_order = self.extent_order();
        let window_order = window.extent_order();
        if send_order >= window_order {
            let offset = hot_spot & low_mask(send_order) & !low_mask(window_order);
            Some(MapPlacement {
                source: self.base().wrapping_add(offset),
                dest: window.base(),
                order: window_order.min(63) as u8,
            })
        } else {
            let offset = hot_spot & low_mask(window_order) & !low_mask(send_order);
            Some(MapPlacement {
                source: self.base(),
                dest: window.base().wrapping_add(offset),
                order: send_order as u8,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_fpage_fields() {
        let fp = Fpage::memory(0x40_0000, 22, FpageRights::RW);
        assert_eq!(fp.base(), 0x40_0000);
        assert_eq!(fp.order(), 22);
        assert_eq!(fp.rights(), FpageRights::RW);
        assert_eq!(fp.space(), FpageSpace::Memory);
        assert!(fp.is_valid());
        assert_eq!(Fpage::from_raw(fp.raw()), fp);
    }

    #[test]
    fn test_memory_base_is_aligned() {
        let fp = Fpage::memory(0x12_3456, 16, FpageRights::READ);
        assert_eq!(fp.base(), 0x12_0000);
        assert!(fp.is_valid());
    }

    #[test]
    fn test_whole_space_sentinel() {
        assert!(Fpage::whole_space(FpageRights::RWX).is_whole_space());
        assert!(Fpage::memory(0, WHOLE_SPACE_ORDER, FpageRights::READ).is_whole_space());
        assert!(!Fpage::memory(0x1000, WHOLE_SPACE_ORDER, FpageRights::READ).is_whole_space());
        for order in [0u8, 2, 12, 30, 63] {
            assert!(!Fpage::memory(0, order, FpageRights::READ).is_whole_space());
        }
    }

    #[test]
    fn test_io_fpage() {
        let fp = Fpage::io(0x3f8, 3, FpageRights::RW);
        assert_eq!(fp.space(), FpageSpace::Io);
        assert_eq!(fp.base(), 0x3f8);
        assert_eq!(fp.order(), 3);
        assert!(fp.is_valid());
    }

    #[test]
    fn test_nil_is_invalid() {
        assert!(!Fpage::NIL.is_valid());
        assert!(Fpage::memory(0x1000, 12, FpageRights::RW).is_valid());
    }

    #[test]
    fn test_fit_small_into_large_window() {
        let send = Fpage::memory(0x8000, 12, FpageRights::READ);
        let window = Fpage::memory(0x100_0000, 20, FpageRights::RWX);
        let placed = send.fit_into(&window, 0x3_5123).unwrap();
        assert_eq!(placed.source, 0x8000);
        assert_eq!(placed.dest, 0x103_5000);
        assert_eq!(placed.order, 12);
    }

    #[test]
    fn test_fit_large_into_small_window() {
        let send = Fpage::memory(0x40_0000, 22, FpageRights::RW);
        let window = Fpage::memory(0x9000, 12, FpageRights::RW);
        let placed = send.fit_into(&window, 0x2_3000).unwrap();
        assert_eq!(placed.source, 0x42_3000);
        assert_eq!(placed.dest, 0x9000);
        assert_eq!(placed.order, 12);
    }

    #[test]
    fn test_fit_rejects_mixed_spaces() {
        let send = Fpage::io(0x60, 2, FpageRights::RW);
        let window = Fpage::whole_space(FpageRights::RWX);
        assert!(send.fit_into(&window, 0).is_none());
    }
}
