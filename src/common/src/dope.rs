//! Message dopes: the compact size/outcome words of an IPC.
//!
//! The same layout serves three roles: the declared buffer size and declared
//! send size in a long-message header, and the outcome reported to each
//! partner after a transfer.
//!
//! ```text
//!  31                 13 12    8 7     4  3   2   1   0
//! +---------------------+-------+-------+---+---+---+---+
//! | words               |strings| error |in |rd |fp |dc |
//! +---------------------+-------+-------+---+---+---+---+
//! ```

use crate::error::IpcError;

const DECEITED: u32 = 1 << 0;
const FPAGE_RECEIVED: u32 = 1 << 1;
const REDIRECTED: u32 = 1 << 2;
const SRC_INSIDE: u32 = 1 << 3;
const ERROR_SHIFT: u32 = 4;
const ERROR_MASK: u32 = 0xf << ERROR_SHIFT;
const STRINGS_SHIFT: u32 = 8;
const STRINGS_MASK: u32 = 0x1f;
const WORDS_SHIFT: u32 = 13;
const WORDS_MASK: u32 = 0x7_ffff;

/// Largest word count a dope can carry.
pub const MAX_WORDS: u32 = WORDS_MASK;
/// Largest string count a dope can carry.
pub const MAX_STRINGS: u32 = STRINGS_MASK;

/// A packed message dope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MsgDope(u32);

impl MsgDope {
    /// Dope declaring `words` message words and `strings` indirect strings.
    /// Counts are truncated to their field widths.
    pub const fn new(words: u32, strings: u32) -> Self {
        MsgDope((words & WORDS_MASK) << WORDS_SHIFT | (strings & STRINGS_MASK) << STRINGS_SHIFT)
    }

    /// An outcome consisting of nothing but an error class.
    pub const fn from_error(error: IpcError) -> Self {
        MsgDope((error.code() as u32) << ERROR_SHIFT)
    }

    pub const fn from_raw(raw: u32) -> Self {
        MsgDope(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn words(&self) -> u32 {
        (self.0 >> WORDS_SHIFT) & WORDS_MASK
    }

    pub const fn strings(&self) -> u32 {
        (self.0 >> STRINGS_SHIFT) & STRINGS_MASK
    }

    pub fn error(&self) -> Option<IpcError> {
        IpcError::from_code(((self.0 & ERROR_MASK) >> ERROR_SHIFT) as u8)
    }

    pub const fn has_error(&self) -> bool {
        self.0 & ERROR_MASK != 0
    }

    /// The send-error bit: the error class was raised by a send phase.
    pub fn send_error(&self) -> bool {
        self.error().is_some_and(IpcError::is_send_side)
    }

    pub const fn is_ok(&self) -> bool {
        !self.has_error()
    }

    pub const fn with_words(self, words: u32) -> Self {
        MsgDope(self.0 & !(WORDS_MASK << WORDS_SHIFT) | (words & WORDS_MASK) << WORDS_SHIFT)
    }

    pub const fn with_strings(self, strings: u32) -> Self {
        MsgDope(
            self.0 & !(STRINGS_MASK << STRINGS_SHIFT) | (strings & STRINGS_MASK) << STRINGS_SHIFT,
        )
    }

    pub const fn with_error(self, error: IpcError) -> Self {
        MsgDope(self.0 & !ERROR_MASK | (error.code() as u32) << ERROR_SHIFT)
    }

    pub const fn without_error(self) -> Self {
        MsgDope(self.0 & !ERROR_MASK)
    }

    pub const fn deceited(&self) -> bool {
        self.0 & DECEITED != 0
    }

    pub const fn fpage_received(&self) -> bool {
        self.0 & FPAGE_RECEIVED != 0
    }

    pub const fn redirected(&self) -> bool {
        self.0 & REDIRECTED != 0
    }

    /// The sender lives inside the receiver's clan or task.
    pub const fn src_inside(&self) -> bool {
        self.0 & SRC_INSIDE != 0
    }

    pub const fn with_deceited(self) -> Self {
        MsgDope(self.0 | DECEITED)
    }

    pub const fn with_fpage_received(self) -> Self {
        MsgDope(self.0 | FPAGE_RECEIVED)
    }

    pub const fn with_src_inside(self) -> Self {
        MsgDope(self.0 | SRC_INSIDE)
    }

    /// Merges the dope of a later transfer phase into this one.
    ///
    /// Flags and counts are OR'd. The error class of `other` replaces ours
    /// when it has one; otherwise ours survives.
    pub const fn combine(self, other: MsgDope) -> Self {
        if other.has_error() {
            MsgDope((self.0 & !ERROR_MASK) | other.0)
        } else {
            MsgDope(self.0 | other.0)
        }
    }
}
