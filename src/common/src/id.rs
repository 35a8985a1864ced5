//! Thread identifiers.
//!
//! Two wire layouts coexist: the 64-bit [`V2Id`] with site, chief and nest
//! fields, and the 32-bit [`V4Id`] carrying only a thread number and a
//! version. The kernel relies on nothing but [`ThreadIdentifier`], so either
//! layout can back [`ThreadId`](crate::ThreadId).
//!
//! Every accessor is a plain shift-and-mask over the raw word. Any raw value
//! decodes to *something*; there is no failure path.

use core::fmt;

/// Width of the local-thread field, shared by both layouts.
pub const LTHREAD_BITS: u32 = 7;
/// Width of the task field, shared by both layouts.
pub const TASK_BITS: u32 = 11;

const LTHREAD_MASK: u32 = (1 << LTHREAD_BITS) - 1;
const TASK_MASK: u32 = (1 << TASK_BITS) - 1;

/// Capabilities every identifier layout provides.
pub trait ThreadIdentifier: Copy + Eq + Ord + fmt::Debug + fmt::Display {
    /// Raw storage word.
    type Raw: Copy + Eq + fmt::Debug;

    /// The all-zero identifier.
    const NIL: Self;
    /// The distinguished "invalid" pattern (all ones).
    const INVALID: Self;
    /// Width of the version field in bits.
    const VERSION_BITS: u32;

    /// Reinterprets a raw word.
    fn from_raw(raw: Self::Raw) -> Self;
    /// Raw storage word.
    fn raw(&self) -> Self::Raw;
    /// Builds an identifier from its portable fields; excess bits are dropped.
    fn from_parts(task: u32, lthread: u32, version: u32) -> Self;

    /// Task number.
    fn task_number(&self) -> u32;
    /// Local thread number inside the task.
    fn local_thread(&self) -> u32;
    /// Version (generation) counter.
    fn version(&self) -> u32;
    /// The owning task's identifier: this identifier with the local-thread
    /// field zeroed.
    fn task(&self) -> Self;

    /// Version-free thread number, unique per (task, local thread).
    fn global_thread(&self) -> u32 {
        (self.task_number() << LTHREAD_BITS) | self.local_thread()
    }

    /// Version to hand out when a (task, local thread) slot is reused.
    fn next_version(version: u32) -> u32 {
        let mask = (1u32 << Self::VERSION_BITS) - 1;
        match version.wrapping_add(1) & mask {
            0 => 1,
            v => v,
        }
    }

    fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }

    /// True if both identifiers name threads of the same task.
    fn same_task(&self, other: &Self) -> bool {
        self.task_number() == other.task_number()
    }
}

/// Fields of the v2 layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct V2Fields {
    /// 14-bit version, stored split into a low (10) and a high (4) part.
    pub version: u32,
    pub lthread: u32,
    pub task: u32,
    /// 17-bit site number.
    pub site: u32,
    /// 11-bit chief task number.
    pub chief: u32,
    /// 4-bit clan nesting level.
    pub nest: u32,
}

/// Packed 64-bit v2 identifier.
///
/// Low word: `version_low:10 | lthread:7 | task:11 | version_high:4`.
/// High word: `site:17 | chief:11 | nest:4`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct V2Id(u64);

impl V2Id {
    const VERSION_LOW_BITS: u32 = 10;
    const LTHREAD_SHIFT: u32 = 10;
    const TASK_SHIFT: u32 = 17;
    const VERSION_HIGH_SHIFT: u32 = 28;
    const SITE_SHIFT: u32 = 32;
    const CHIEF_SHIFT: u32 = 49;
    const NEST_SHIFT: u32 = 60;

    /// Packs all v2 fields.
    pub const fn new(f: V2Fields) -> Self {
        let version_low = (f.version & 0x3ff) as u64;
        let version_high = ((f.version >> Self::VERSION_LOW_BITS) & 0xf) as u64;
        V2Id(
            version_low
                | ((f.lthread & LTHREAD_MASK) as u64) << Self::LTHREAD_SHIFT
                | ((f.task & TASK_MASK) as u64) << Self::TASK_SHIFT
                | version_high << Self::VERSION_HIGH_SHIFT
                | ((f.site & 0x1_ffff) as u64) << Self::SITE_SHIFT
                | ((f.chief & TASK_MASK) as u64) << Self::CHIEF_SHIFT
                | ((f.nest & 0xf) as u64) << Self::NEST_SHIFT,
        )
    }

    /// Unpacks all v2 fields.
    pub const fn fields(&self) -> V2Fields {
        let raw = self.0;
        V2Fields {
            version: ((raw & 0x3ff)
                | ((raw >> Self::VERSION_HIGH_SHIFT) & 0xf) << Self::VERSION_LOW_BITS)
                as u32,
            lthread: ((raw >> Self::LTHREAD_SHIFT) as u32) & LTHREAD_MASK,
            task: ((raw >> Self::TASK_SHIFT) as u32) & TASK_MASK,
            site: ((raw >> Self::SITE_SHIFT) & 0x1_ffff) as u32,
            chief: ((raw >> Self::CHIEF_SHIFT) as u32) & TASK_MASK,
            nest: ((raw >> Self::NEST_SHIFT) & 0xf) as u32,
        }
    }

    /// Chief (clan owner) task number.
    pub const fn chief(&self) -> u32 {
        self.fields().chief
    }

    /// Clan nesting level.
    pub const fn nest(&self) -> u32 {
        self.fields().nest
    }

    pub const fn site(&self) -> u32 {
        self.fields().site
    }
}

impl ThreadIdentifier for V2Id {
    type Raw = u64;

    const NIL: Self = V2Id(0);
    const INVALID: Self = V2Id(u64::MAX);
    const VERSION_BITS: u32 = 14;

    fn from_raw(raw: u64) -> Self {
        V2Id(raw)
    }

    fn raw(&self) -> u64 {
        self.0
    }

    fn from_parts(task: u32, lthread: u32, version: u32) -> Self {
        V2Id::new(V2Fields {
            version,
            lthread,
            task,
            ..V2Fields::default()
        })
    }

    fn task_number(&self) -> u32 {
        self.fields().task
    }

    fn local_thread(&self) -> u32 {
        self.fields().lthread
    }

    fn version(&self) -> u32 {
        self.fields().version
    }

    fn task(&self) -> Self {
        V2Id(self.0 & !((LTHREAD_MASK as u64) << Self::LTHREAD_SHIFT))
    }
}

impl fmt::Debug for V2Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V2Id({:#018x})", self.0)
    }
}

impl fmt::Display for V2Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            return write!(f, "nil");
        }
        if self.is_invalid() {
            return write!(f, "invalid");
        }
        write!(f, "{:x}.{:02x}", self.task_number(), self.local_thread())
    }
}

/// Packed 32-bit v4 identifier.
///
/// A global identifier holds an 18-bit thread number above
/// [`V4Id::GLOBAL_SHIFT`] and a 14-bit version below it. The thread number
/// splits into `task:11 | lthread:7`. Local identifiers are
/// UTCB-relative indices shifted by [`V4Id::LOCAL_SHIFT`], which leaves
/// their low six bits clear; global versions always keep at least one of
/// those bits set so the two kinds never collide.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct V4Id(u32);

impl V4Id {
    /// Separates the thread number from the version.
    pub const GLOBAL_SHIFT: u32 = 14;
    /// Shift applied to local (UTCB-relative) identifiers.
    pub const LOCAL_SHIFT: u32 = 6;

    const VERSION_MASK: u32 = (1 << Self::GLOBAL_SHIFT) - 1;
    const LOCAL_MASK: u32 = (1 << Self::LOCAL_SHIFT) - 1;

    /// Builds a global identifier from a thread number and a version.
    pub const fn global(thread_no: u32, version: u32) -> Self {
        V4Id((thread_no << Self::GLOBAL_SHIFT) | (version & Self::VERSION_MASK))
    }

    /// Builds a local identifier from a UTCB index.
    pub const fn local(index: u32) -> Self {
        V4Id(index << Self::LOCAL_SHIFT)
    }

    /// 18-bit thread number.
    pub const fn thread_no(&self) -> u32 {
        self.0 >> Self::GLOBAL_SHIFT
    }

    pub const fn is_local(&self) -> bool {
        self.0 != 0 && self.0 != u32::MAX && self.0 & Self::LOCAL_MASK == 0
    }

    /// UTCB index of a local identifier.
    pub const fn local_index(&self) -> Option<u32> {
        if self.is_local() {
            Some(self.0 >> Self::LOCAL_SHIFT)
        } else {
            None
        }
    }
}

impl ThreadIdentifier for V4Id {
    type Raw = u32;

    const NIL: Self = V4Id(0);
    const INVALID: Self = V4Id(u32::MAX);
    const VERSION_BITS: u32 = 14;

    fn from_raw(raw: u32) -> Self {
        V4Id(raw)
    }

    fn raw(&self) -> u32 {
        self.0
    }

    fn from_parts(task: u32, lthread: u32, version: u32) -> Self {
        V4Id::global(
            ((task & TASK_MASK) << LTHREAD_BITS) | (lthread & LTHREAD_MASK),
            version,
        )
    }

    fn task_number(&self) -> u32 {
        (self.thread_no() >> LTHREAD_BITS) & TASK_MASK
    }

    fn local_thread(&self) -> u32 {
        self.thread_no() & LTHREAD_MASK
    }

    fn version(&self) -> u32 {
        self.0 & Self::VERSION_MASK
    }

    fn task(&self) -> Self {
        V4Id(self.0 & !(LTHREAD_MASK << Self::GLOBAL_SHIFT))
    }

    fn next_version(version: u32) -> u32 {
        let mut next = (version.wrapping_add(1)) & Self::VERSION_MASK;
        // A version with clear low bits would read back as a local identifier.
        while next & Self::LOCAL_MASK == 0 {
            next = (next + 1) & Self::VERSION_MASK;
        }
        next
    }
}

impl fmt::Debug for V4Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V4Id({:#010x})", self.0)
    }
}

impl fmt::Display for V4Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            return write!(f, "nil");
        }
        if self.is_invalid() {
            return write!(f, "invalid");
        }
        if let Some(index) = self.local_index() {
            return write!(f, "local:{index}");
        }
        write!(f, "{:x}.{:02x}", self.task_number(), self.local_thread())
    }
}
